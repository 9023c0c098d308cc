//! Host (native) functions and package imports.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use super::error::{Result, VmError};
use super::heap::Heap;
use super::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFnId(pub u32);

/// Maximum number of parameters a host function may declare.
pub const MAX_HOST_PARAMS: usize = 3;

/// What a host function can touch while it runs.
pub struct HostCtx<'a> {
    pub heap: &'a mut Heap,
    pub output: &'a mut dyn Write,
}

pub type HostFnPtr = fn(&mut HostCtx<'_>, &[Value]) -> Result<Value>;

pub struct HostFn {
    name: String,
    num_params: usize,
    func: HostFnPtr,
}

impl HostFn {
    pub fn new(name: impl Into<String>, num_params: usize, func: HostFnPtr) -> Self {
        let name = name.into();
        assert!(
            num_params <= MAX_HOST_PARAMS,
            "host function {} declares {} parameters (max {})",
            name,
            num_params,
            MAX_HOST_PARAMS
        );
        Self {
            name,
            num_params,
            func,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Invoke the function. The caller has already checked the arity.
    pub fn call(&self, ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
        assert_eq!(
            args.len(),
            self.num_params,
            "host function {} called with wrong arity",
            self.name
        );
        (self.func)(ctx, args)
    }
}

impl std::fmt::Debug for HostFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFn")
            .field("name", &self.name)
            .field("num_params", &self.num_params)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct HostRegistry {
    fns: Vec<HostFn>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, f: HostFn) -> HostFnId {
        let id = HostFnId(self.fns.len() as u32);
        self.fns.push(f);
        id
    }

    pub fn get(&self, id: HostFnId) -> &HostFn {
        self.fns
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unknown host function id {}", id.0))
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

fn expect_int(name: &'static str, v: Value) -> Result<i64> {
    v.as_int64().ok_or_else(|| VmError::Host {
        name: name.to_string(),
        message: format!("expected int64 argument, got {}", v.type_name()),
    })
}

fn io_error(name: &'static str, e: std::io::Error) -> VmError {
    VmError::Host {
        name: name.to_string(),
        message: format!("io error: {}", e),
    }
}

fn print_str(ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let s = args[0]
        .as_str()
        .and_then(|r| ctx.heap.string(r))
        .ok_or_else(|| VmError::Host {
            name: "print_str".to_string(),
            message: format!("expected string argument, got {}", args[0].type_name()),
        })?;
    write!(ctx.output, "{}", s).map_err(|e| io_error("print_str", e))?;
    Ok(Value::Undef)
}

fn print_int(ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let n = expect_int("print_int", args[0])?;
    write!(ctx.output, "{}", n).map_err(|e| io_error("print_int", e))?;
    Ok(Value::Undef)
}

fn println(ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let s = ctx.heap.display(args[0]);
    writeln!(ctx.output, "{}", s).map_err(|e| io_error("println", e))?;
    Ok(Value::Undef)
}

fn math_min(_ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let a = expect_int("min", args[0])?;
    let b = expect_int("min", args[1])?;
    Ok(Value::Int64(a.min(b)))
}

fn math_max(_ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let a = expect_int("max", args[0])?;
    let b = expect_int("max", args[1])?;
    Ok(Value::Int64(a.max(b)))
}

fn math_abs(_ctx: &mut HostCtx<'_>, args: &[Value]) -> Result<Value> {
    let a = expect_int("abs", args[0])?;
    Ok(Value::Int64(a.wrapping_abs()))
}

/// Host functions exported by a built-in package.
fn builtin_package(name: &str) -> Option<Vec<HostFn>> {
    match name {
        "core/io" => Some(vec![
            HostFn::new("print_str", 1, print_str),
            HostFn::new("print_int", 1, print_int),
            HostFn::new("println", 1, println),
        ]),
        "core/math" => Some(vec![
            HostFn::new("min", 2, math_min),
            HostFn::new("max", 2, math_max),
            HostFn::new("abs", 1, math_abs),
        ]),
        _ => None,
    }
}

/// Resolves package names for the `import` instruction.
///
/// Built-in packages come first; other names are looked up as
/// `<name>.json` program images in the search paths. Each package is
/// loaded once and the same package object is returned afterwards.
#[derive(Debug, Default)]
pub struct ImportResolver {
    cache: HashMap<String, Value>,
    search_paths: Vec<PathBuf>,
}

impl ImportResolver {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            cache: HashMap::new(),
            search_paths,
        }
    }

    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.push(path);
    }

    pub fn import(&mut self, name: &str, heap: &mut Heap, hosts: &mut HostRegistry) -> Result<Value> {
        if let Some(pkg) = self.cache.get(name) {
            return Ok(*pkg);
        }

        let pkg = if let Some(fns) = builtin_package(name) {
            let obj = heap.alloc_object(fns.len());
            for f in fns {
                let field = f.name().to_string();
                let id = hosts.register(f);
                heap.object_mut(obj)
                    .expect("freshly allocated object")
                    .set_field(&field, Value::HostFn(id))?;
            }
            Value::Object(obj)
        } else {
            let path = self
                .search_paths
                .iter()
                .map(|dir| dir.join(format!("{}.json", name)))
                .find(|p| p.is_file())
                .ok_or_else(|| VmError::ImportFailed {
                    name: name.to_string(),
                    reason: "package not found".to_string(),
                })?;
            tracing::info!(package = name, path = %path.display(), "importing package image");
            let root = crate::image::load_image_file(&path, heap).map_err(|reason| {
                VmError::ImportFailed {
                    name: name.to_string(),
                    reason,
                }
            })?;
            Value::Object(root)
        };

        self.cache.insert(name.to_string(), pkg);
        Ok(pkg)
    }
}
