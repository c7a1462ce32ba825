//! The `import` builtin: builtin-module lookup, else compile-and-run a
//! source file, cached by absolute path (one compile-and-run per distinct
//! path per process).

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::compiler::CompilerOptions;
use crate::error::{VmError, VmResult};
use crate::registry::{Args, RegistryBuilder};
use crate::value::Value;
use crate::vm::Vm;

pub fn register(builder: &mut RegistryBuilder) {
    let cache: Arc<Mutex<FxHashMap<String, Value>>> = Arc::new(Mutex::new(FxHashMap::default()));

    builder.register_func("import", move |vm, args| {
        let name = Args(args).string(0)?;

        if let Some(cached) = cache.lock().get(name.as_ref()) {
            return Ok(cached.clone());
        }

        // Builtin modules first; a factory module is instantiated once and
        // then served from the cache.
        if let Some(module) = vm.registry().resolve_module(&name) {
            cache.lock().insert(name.to_string(), module.clone());
            return Ok(module);
        }

        let path = resolve_path(vm, name.as_ref());
        let key = path.to_string_lossy().to_string();
        if let Some(cached) = cache.lock().get(&key) {
            return Ok(cached.clone());
        }

        let module = load_file(vm, &path)?;
        cache.lock().insert(key, module.clone());
        Ok(module)
    });
}

/// Import paths resolve relative to the importing file's directory.
fn resolve_path(vm: &Vm, name: &str) -> PathBuf {
    let relative = match vm.current_path().and_then(|p| p.parent().map(PathBuf::from)) {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    };
    relative.canonicalize().unwrap_or(relative)
}

/// Compile a module file as its own unit and run its body; the module's
/// top-level return value is what `import` yields.
fn load_file(vm: &mut Vm, path: &PathBuf) -> VmResult<Value> {
    debug!(path = %path.display(), "loading module");
    let source = std::fs::read_to_string(path).map_err(|e| VmError::raise(e.to_string()))?;

    let options = CompilerOptions {
        optimize: true,
        global_entry: false,
    };
    let program = crate::compile_source(
        &source,
        vm.registry(),
        options,
        Some(path.clone()),
    )
    .map_err(|e| VmError::raise(e.to_string()))?;

    vm.run_function(program.entry_value(), &[])
}
