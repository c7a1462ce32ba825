//! The builtin registry: core native functions plus namespaced modules.

mod arr;
mod core;
mod fiber;
mod io;
mod json;
mod math;
mod modules;
mod strings;
mod time;

use crate::registry::{Registry, RegistryBuilder};

/// Build the standard registry threaded through the whole pipeline.
pub fn std_registry() -> Registry {
    let mut builder = RegistryBuilder::new();

    core::register(&mut builder);
    arr::register(&mut builder);
    modules::register(&mut builder);

    fiber::register(&mut builder);
    math::register(&mut builder);
    strings::register(&mut builder);
    time::register(&mut builder);
    io::register(&mut builder);
    json::register(&mut builder);

    builder.build()
}
