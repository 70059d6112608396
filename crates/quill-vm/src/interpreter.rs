//! Tree-walking interpreter.
//!
//! All state lives behind `Cell`/`RefCell` so that host callbacks, which
//! re-enter through the C API with the same `*mut QuillVM`, only ever see a
//! shared reference. No `RefCell` borrow is held across a call into host code.

use crate::ast::*;
use crate::c_api::{
    QuillConfiguration, QuillErrorType, QuillForeignClassMethods, QuillForeignMethodFn,
    QuillHandle, QuillHostString, QuillInterpretResult, QuillType, QuillVM,
};
use crate::builtins::{self, CoreClasses};
use crate::error::{CompileError, CompileResult};
use crate::heap::{Heap, HeapConfig};
use crate::parser::parse;
use crate::random;
use crate::value::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::{Cell, RefCell};
use std::ffi::{c_void, CStr, CString};
use std::rc::Rc;

/// Deepest nesting of method, function and primitive calls before a
/// "Stack overflow." error is raised.
pub const MAX_CALL_DEPTH: usize = 128;

/// A guest error in flight, with the stack captured where it was raised.
#[derive(Debug, Clone)]
pub struct Throw {
    pub value: Value,
    pub trace: Vec<TraceFrame>,
}

/// One line of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub module: String,
    pub line: u32,
    pub function: String,
}

enum FrameKind {
    Script,
    Fn,
    Method { class: ObjId, decl: Rc<MethodDecl> },
}

struct Frame {
    module: Rc<Module>,
    kind: FrameKind,
    line: u32,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Payload behind a `*mut QuillHandle`.
pub struct HandleData {
    pub value: Value,
    /// Set for handles made by `quill_make_call_handle`.
    pub signature: Option<String>,
}

pub struct Interpreter {
    pub(crate) heap: RefCell<Heap>,
    config: QuillConfiguration,
    user_data: Cell<*mut c_void>,
    pub(crate) core: CoreClasses,
    core_module: Rc<Module>,
    modules: RefCell<FxHashMap<String, Rc<Module>>>,
    slots: RefCell<Vec<Value>>,
    handles: RefCell<FxHashSet<*mut HandleData>>,
    frames: RefCell<Vec<Frame>>,
    depth: Cell<usize>,
    running: Cell<bool>,
    pending_abort: Cell<Option<Value>>,
    gc_requested: Cell<bool>,
}

impl Interpreter {
    pub fn new(config: QuillConfiguration) -> Box<Self> {
        let heap_config = HeapConfig {
            initial_heap_size: config.initial_heap_size,
            min_heap_size: config.min_heap_size,
            heap_growth_percent: config.heap_growth_percent.max(0) as usize,
        };
        let mut heap = Heap::new(heap_config);
        let (core, globals) = builtins::bootstrap(&mut heap);
        let core_module = Rc::new(Module::new("core"));
        core_module
            .vars
            .borrow_mut()
            .extend(globals.into_iter().map(|(name, id)| (name.to_string(), Value::Obj(id))));

        Box::new(Self {
            heap: RefCell::new(heap),
            config,
            user_data: Cell::new(config.user_data),
            core,
            core_module,
            modules: RefCell::new(FxHashMap::default()),
            slots: RefCell::new(Vec::new()),
            handles: RefCell::new(FxHashSet::default()),
            frames: RefCell::new(Vec::new()),
            depth: Cell::new(0),
            running: Cell::new(false),
            pending_abort: Cell::new(None),
            gc_requested: Cell::new(false),
        })
    }

    /// Recovers the interpreter behind a `*mut QuillVM`.
    ///
    /// # Safety
    /// `vm` must come from [`Interpreter::as_raw`] on a live interpreter.
    pub unsafe fn from_raw<'a>(vm: *mut QuillVM) -> &'a Interpreter {
        &*(vm as *const Interpreter)
    }

    /// The pointer host callbacks receive. Stable because the interpreter is boxed.
    pub fn as_raw(&self) -> *mut QuillVM {
        self as *const Self as *mut QuillVM
    }

    pub fn user_data(&self) -> *mut c_void {
        self.user_data.get()
    }

    pub fn set_user_data(&self, data: *mut c_void) {
        self.user_data.set(data);
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Compiles and runs `source` in `module`, creating the module if needed.
    pub fn interpret(&self, module_name: &str, source: &str) -> QuillInterpretResult {
        if self.running.get() {
            self.report_reentry();
            return QuillInterpretResult::RuntimeError;
        }
        let program = match self.compile(module_name, source) {
            Ok(program) => program,
            Err(err) => {
                let line = err.line as i32;
                self.report_error(QuillErrorType::Compile, Some(module_name), line, &err.message);
                return QuillInterpretResult::CompileError;
            }
        };
        let module = self.module_or_create(module_name);

        self.running.set(true);
        let result = self.run_program(&module, &program);
        self.finish_run();

        let status = match result {
            Ok(()) => QuillInterpretResult::Success,
            Err(throw) => {
                self.report_runtime_error(&throw);
                QuillInterpretResult::RuntimeError
            }
        };
        self.safepoint();
        status
    }

    /// Invokes a call handle's method on slot 0 with slots `1..=arity` as arguments.
    pub fn call(&self, handle: *mut QuillHandle) -> QuillInterpretResult {
        if self.running.get() {
            self.report_reentry();
            return QuillInterpretResult::RuntimeError;
        }
        let Some(signature) = self.handle_signature(handle) else {
            self.report_error(QuillErrorType::Runtime, None, -1, "Handle is not a call handle.");
            return QuillInterpretResult::RuntimeError;
        };
        let arity = signature_arity(&signature);
        let args: Vec<Value> = {
            let slots = self.slots.borrow();
            if slots.len() <= arity {
                drop(slots);
                self.report_error(QuillErrorType::Runtime, None, -1, "Not enough slots for call.");
                return QuillInterpretResult::RuntimeError;
            }
            slots[..=arity].to_vec()
        };

        self.running.set(true);
        let result = self.invoke(&signature, &args);
        self.finish_run();

        let status = match result {
            Ok(value) => {
                self.set_slot(0, value);
                QuillInterpretResult::Success
            }
            Err(throw) => {
                self.report_runtime_error(&throw);
                QuillInterpretResult::RuntimeError
            }
        };
        self.safepoint();
        status
    }

    fn finish_run(&self) {
        self.running.set(false);
        self.frames.borrow_mut().clear();
        self.depth.set(0);
    }

    fn report_reentry(&self) {
        self.report_error(
            QuillErrorType::Runtime,
            None,
            -1,
            "Cannot run code in a VM that is already running.",
        );
    }

    // ========================================================================
    // Compilation
    // ========================================================================

    /// Parses `source` and binds every foreign method it declares.
    pub fn compile(&self, module_name: &str, source: &str) -> CompileResult<Block> {
        let program = parse(source)?;
        for stmt in &program {
            let StmtKind::Class(class) = &stmt.kind else {
                continue;
            };
            for method in class.methods.iter().filter(|m| m.is_foreign) {
                let is_static = method.kind == MethodKind::Static;
                let bound = self
                    .bind_foreign_method(module_name, &class.name, is_static, &method.signature)
                    .ok_or_else(|| {
                        CompileError::new(
                            method.line,
                            format!(
                                "Could not find foreign method '{}' for class {} in module '{}'.",
                                method.signature, class.name, module_name
                            ),
                        )
                    })?;
                method.bound.set(Some(bound));
            }
        }
        Ok(program)
    }

    fn bind_foreign_method(
        &self,
        module: &str,
        class: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<QuillForeignMethodFn> {
        let from_host = self.config.bind_foreign_method_fn.and_then(|bind| {
            let module = to_cstring(module.as_bytes());
            let class = to_cstring(class.as_bytes());
            let signature = to_cstring(signature.as_bytes());
            unsafe {
                bind(
                    self.as_raw(),
                    module.as_ptr(),
                    class.as_ptr(),
                    is_static,
                    signature.as_ptr(),
                )
            }
        });
        from_host.or_else(|| {
            (module == random::MODULE_NAME)
                .then(|| random::bind_method(class, is_static, signature))
                .flatten()
        })
    }

    fn bind_foreign_class(&self, module: &str, class: &str) -> QuillForeignClassMethods {
        let from_host = self
            .config
            .bind_foreign_class_fn
            .map(|bind| {
                let module = to_cstring(module.as_bytes());
                let class = to_cstring(class.as_bytes());
                unsafe { bind(self.as_raw(), module.as_ptr(), class.as_ptr()) }
            })
            .unwrap_or_default();
        let unbound = from_host.allocate.is_none() && from_host.finalize.is_none();
        if unbound && module == random::MODULE_NAME {
            return random::bind_class(class);
        }
        from_host
    }

    // ========================================================================
    // Modules
    // ========================================================================

    fn module_or_create(&self, name: &str) -> Rc<Module> {
        self.modules
            .borrow_mut()
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(Module::new(name)))
            .clone()
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.borrow().contains_key(name)
    }

    pub fn module_variable(&self, module: &str, name: &str) -> Option<Value> {
        let module = self.modules.borrow().get(module).cloned()?;
        module.get(name)
    }

    fn run_program(&self, module: &Rc<Module>, program: &Block) -> Result<(), Throw> {
        let ctx = Closure {
            module: module.clone(),
            env: None,
            this: None,
            class: None,
        };
        self.enter_frame(module.clone(), FrameKind::Script, 1)?;
        let result = self.exec_stmts(program, &ctx);
        self.leave_frame();
        result.map(|_| ())
    }

    fn import(&self, ctx: &Closure, name: &str, names: &[ImportName]) -> Result<(), Throw> {
        let resolved = self.resolve_module(&ctx.module.name, name);
        let existing = self.modules.borrow().get(&resolved).cloned();
        let module = match existing {
            Some(module) => module,
            None => self.load_module(&resolved)?,
        };
        for import in names {
            let value = module.get(&import.name).ok_or_else(|| {
                self.error(format!(
                    "Could not find a variable named '{}' in module '{}'.",
                    import.name, resolved
                ))
            })?;
            self.define(ctx, import.local(), value);
        }
        Ok(())
    }

    fn resolve_module(&self, importer: &str, name: &str) -> String {
        let Some(resolve) = self.config.resolve_module_fn else {
            return name.to_string();
        };
        let importer_c = to_cstring(importer.as_bytes());
        let name_c = to_cstring(name.as_bytes());
        let result = unsafe { resolve(self.as_raw(), importer_c.as_ptr(), name_c.as_ptr()) };
        unsafe { take_host_string(result) }.unwrap_or_else(|| name.to_string())
    }

    fn load_module(&self, name: &str) -> Result<Rc<Module>, Throw> {
        let from_host = self.config.load_module_fn.and_then(|load| {
            let name_c = to_cstring(name.as_bytes());
            let result = unsafe { load(self.as_raw(), name_c.as_ptr()) };
            unsafe { take_host_string(result) }
        });
        let source = from_host
            .or_else(|| random::module_source(name).map(str::to_string))
            .ok_or_else(|| self.error(format!("Could not load module '{name}'.")))?;

        let program = match self.compile(name, &source) {
            Ok(program) => program,
            Err(err) => {
                let line = err.line as i32;
                self.report_error(QuillErrorType::Compile, Some(name), line, &err.message);
                return Err(self.error(format!("Could not compile module '{name}'.")));
            }
        };
        let module = self.module_or_create(name);
        self.run_program(&module, &program)?;
        Ok(module)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec_stmts(&self, stmts: &[Stmt], ctx: &Closure) -> Result<Flow, Throw> {
        for stmt in stmts {
            match self.exec_stmt(stmt, ctx)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    /// Runs a loop or branch body, giving blocks their own scope.
    fn exec_scoped(&self, stmt: &Stmt, ctx: &Closure) -> Result<Flow, Throw> {
        match &stmt.kind {
            StmtKind::Block(stmts) => {
                let inner = Closure {
                    env: Some(Env::new(ctx.env.clone())),
                    ..ctx.clone()
                };
                self.exec_stmts(stmts, &inner)
            }
            _ => self.exec_stmt(stmt, ctx),
        }
    }

    fn exec_stmt(&self, stmt: &Stmt, ctx: &Closure) -> Result<Flow, Throw> {
        self.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, ctx)?;
                Ok(Flow::Normal)
            }
            StmtKind::Var { name, init } => {
                let value = match init {
                    Some(expr) => self.eval(expr, ctx)?,
                    None => Value::Null,
                };
                self.define(ctx, name, value);
                Ok(Flow::Normal)
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if !self.eval(cond, ctx)?.is_falsy() {
                    self.exec_scoped(then_branch, ctx)
                } else if let Some(else_branch) = else_branch {
                    self.exec_scoped(else_branch, ctx)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While { cond, body } => {
                while !self.eval(cond, ctx)?.is_falsy() {
                    match self.exec_scoped(body, ctx)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For { var, seq, body } => {
                let seq = self.eval(seq, ctx)?;
                let mut iterator = Value::Null;
                loop {
                    iterator = self.invoke("iterate(_)", &[seq, iterator])?;
                    if iterator.is_falsy() {
                        break;
                    }
                    let value = self.invoke("iteratorValue(_)", &[seq, iterator])?;
                    let env = Env::new(ctx.env.clone());
                    env.vars.borrow_mut().insert(var.clone(), value);
                    let inner = Closure {
                        env: Some(env),
                        ..ctx.clone()
                    };
                    match self.exec_scoped(body, &inner)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Block(_) => self.exec_scoped(stmt, ctx),
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, ctx)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Class(decl) => {
                self.define_class(decl, ctx)?;
                Ok(Flow::Normal)
            }
            StmtKind::Import { module, names } => {
                self.import(ctx, module, names)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn define(&self, ctx: &Closure, name: &str, value: Value) {
        match &ctx.env {
            Some(env) => {
                env.vars.borrow_mut().insert(name.to_string(), value);
            }
            None => {
                ctx.module.vars.borrow_mut().insert(name.to_string(), value);
            }
        }
    }

    fn define_class(&self, decl: &ClassDecl, ctx: &Closure) -> Result<(), Throw> {
        let superclass = match &decl.superclass {
            Some(name) => self.checked_superclass(decl, name, ctx)?,
            None => self.core.object,
        };

        let mut class = ClassObj::new(decl.name.clone(), Some(superclass));
        class.is_foreign = decl.is_foreign;
        if decl.is_foreign {
            let methods = self.bind_foreign_class(&ctx.module.name, &decl.name);
            class.allocate = methods.allocate;
            class.finalize = methods.finalize;
        }
        let class_id = self.heap.borrow_mut().alloc(Obj::Class(class));

        let mut methods = FxHashMap::default();
        let mut static_methods = FxHashMap::default();
        for method in &decl.methods {
            let implementation = if method.is_foreign {
                match method.bound.get() {
                    Some(bound) => Method::Foreign(bound),
                    None => {
                        return Err(self.error(format!(
                            "Foreign method '{}' of class {} is not bound.",
                            method.signature, decl.name
                        )))
                    }
                }
            } else {
                Method::Block {
                    decl: method.clone(),
                    module: ctx.module.clone(),
                    class: class_id,
                }
            };
            match method.kind {
                MethodKind::Instance => {
                    methods.insert(method.signature.clone(), implementation);
                }
                MethodKind::Static => {
                    static_methods.insert(method.signature.clone(), implementation);
                }
                MethodKind::Constructor => {
                    let init = format!("init {}", method.signature);
                    methods.insert(init.clone(), implementation);
                    static_methods.insert(method.signature.clone(), Method::Constructor { init });
                }
            }
        }

        if let Obj::Class(class) = &mut self.heap.borrow_mut()[class_id] {
            class.methods = methods;
            class.static_methods = static_methods;
        }
        self.define(ctx, &decl.name, Value::Obj(class_id));
        Ok(())
    }

    fn checked_superclass(
        &self,
        decl: &ClassDecl,
        name: &str,
        ctx: &Closure,
    ) -> Result<ObjId, Throw> {
        let value = self.lookup_name(name, ctx)?;
        let problem = match value {
            Value::Obj(id) => {
                let heap = self.heap.borrow();
                match &heap[id] {
                    Obj::Class(class) if class.is_foreign => Some(format!(
                        "Class '{}' cannot inherit from foreign class '{}'.",
                        decl.name, class.name
                    )),
                    Obj::Class(class) if self.core.is_sealed(id) => Some(format!(
                        "Class '{}' cannot inherit from built-in class '{}'.",
                        decl.name, class.name
                    )),
                    Obj::Class(_) => None,
                    _ => Some(format!(
                        "Class '{}' cannot inherit from a non-class object.",
                        decl.name
                    )),
                }
            }
            _ => Some(format!("Class '{}' cannot inherit from a non-class object.", decl.name)),
        };
        match (problem, value) {
            (None, Value::Obj(id)) => Ok(id),
            (Some(message), _) => Err(self.error(message)),
            (None, _) => Err(self.error("Superclass must be a class.")),
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&self, expr: &Expr, ctx: &Closure) -> Result<Value, Throw> {
        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Num(n) => Ok(Value::Num(*n)),
            ExprKind::Str(bytes) => Ok(self.new_string(bytes.to_vec())),
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, ctx)?);
                }
                Ok(self.alloc(Obj::List(values)))
            }
            ExprKind::Map(entries) => {
                let mut map = MapObj::default();
                for (key_expr, value_expr) in entries {
                    let key = self.eval(key_expr, ctx)?;
                    let value = self.eval(value_expr, ctx)?;
                    let map_key = self.map_key(key)?;
                    map.insert(map_key, (key, value));
                }
                Ok(self.alloc(Obj::Map(map)))
            }
            ExprKind::Name(name) => self.lookup_name(name, ctx),
            ExprKind::Field(name) => self.get_field(ctx, name),
            ExprKind::StaticField(name) => Ok(self.get_static_field(ctx, name)),
            ExprKind::This => Ok(ctx.this.unwrap_or(Value::Null)),
            ExprKind::Call {
                receiver,
                signature,
                args,
            } => {
                let receiver = match receiver {
                    Some(receiver) => self.eval(receiver, ctx)?,
                    None => ctx.this.ok_or_else(|| {
                        self.error(format!("Cannot call '{signature}' outside of a class method."))
                    })?,
                };
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(receiver);
                for arg in args {
                    argv.push(self.eval(arg, ctx)?);
                }
                self.invoke(signature, &argv)
            }
            ExprKind::SuperCall { signature, args } => {
                let this = ctx.this.unwrap_or(Value::Null);
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(this);
                for arg in args {
                    argv.push(self.eval(arg, ctx)?);
                }
                self.invoke_super(ctx, signature, &argv)
            }
            ExprKind::Fn(decl) => Ok(self.alloc(Obj::Fn(FnObj {
                decl: decl.clone(),
                closure: ctx.clone(),
            }))),
            ExprKind::Assign { target, value } => {
                let value = self.eval(value, ctx)?;
                match &target.kind {
                    ExprKind::Name(name) => self.assign_name(ctx, name, value)?,
                    ExprKind::Field(name) => self.set_field(ctx, name, value)?,
                    ExprKind::StaticField(name) => self.set_static_field(ctx, name, value),
                    _ => return Err(self.error("Invalid assignment target.")),
                }
                Ok(value)
            }
            ExprKind::And(lhs, rhs) => {
                let lhs = self.eval(lhs, ctx)?;
                if lhs.is_falsy() {
                    Ok(lhs)
                } else {
                    self.eval(rhs, ctx)
                }
            }
            ExprKind::Or(lhs, rhs) => {
                let lhs = self.eval(lhs, ctx)?;
                if lhs.is_falsy() {
                    self.eval(rhs, ctx)
                } else {
                    Ok(lhs)
                }
            }
            ExprKind::Conditional {
                cond,
                then_value,
                else_value,
            } => {
                if self.eval(cond, ctx)?.is_falsy() {
                    self.eval(else_value, ctx)
                } else {
                    self.eval(then_value, ctx)
                }
            }
            ExprKind::Is(lhs, rhs) => {
                let value = self.eval(lhs, ctx)?;
                let class = self.eval(rhs, ctx)?;
                self.is_instance(value, class).map(Value::Bool)
            }
        }
    }

    fn lookup_name(&self, name: &str, ctx: &Closure) -> Result<Value, Throw> {
        if let Some(scope) = ctx.env.as_ref().and_then(|env| env.lookup(name)) {
            let value = scope.vars.borrow().get(name).copied();
            return Ok(value.unwrap_or(Value::Null));
        }
        if let Some(this) = ctx.this {
            if starts_lowercase(name) && self.find_method(this, name).is_some() {
                return self.invoke(name, &[this]);
            }
        }
        ctx.module
            .get(name)
            .or_else(|| self.core_module.get(name))
            .ok_or_else(|| self.error(format!("Variable '{name}' is not defined.")))
    }

    fn assign_name(&self, ctx: &Closure, name: &str, value: Value) -> Result<(), Throw> {
        if let Some(scope) = ctx.env.as_ref().and_then(|env| env.lookup(name)) {
            scope.vars.borrow_mut().insert(name.to_string(), value);
            return Ok(());
        }
        if let Some(this) = ctx.this {
            let setter = format!("{name}=(_)");
            if starts_lowercase(name) && self.find_method(this, &setter).is_some() {
                return self.invoke(&setter, &[this, value]).map(|_| ());
            }
        }
        let mut vars = ctx.module.vars.borrow_mut();
        if let Some(slot) = vars.get_mut(name) {
            *slot = value;
            return Ok(());
        }
        drop(vars);
        Err(self.error(format!("Variable '{name}' is not defined.")))
    }

    fn get_field(&self, ctx: &Closure, name: &str) -> Result<Value, Throw> {
        let this = ctx.this.and_then(Value::as_obj);
        let field = this.and_then(|id| match &self.heap.borrow()[id] {
            Obj::Instance(instance) => {
                Some(instance.fields.get(name).copied().unwrap_or(Value::Null))
            }
            _ => None,
        });
        field.ok_or_else(|| self.error("Only instances of classes have fields."))
    }

    fn set_field(&self, ctx: &Closure, name: &str, value: Value) -> Result<(), Throw> {
        let this = ctx.this.and_then(Value::as_obj);
        let stored = this.is_some_and(|id| match &mut self.heap.borrow_mut()[id] {
            Obj::Instance(instance) => {
                instance.fields.insert(name.to_string(), value);
                true
            }
            _ => false,
        });
        if stored {
            Ok(())
        } else {
            Err(self.error("Only instances of classes have fields."))
        }
    }

    fn get_static_field(&self, ctx: &Closure, name: &str) -> Value {
        let Some(class) = ctx.class else {
            return Value::Null;
        };
        match &self.heap.borrow()[class] {
            Obj::Class(class) => class.static_fields.get(name).copied().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn set_static_field(&self, ctx: &Closure, name: &str, value: Value) {
        if let Some(class) = ctx.class {
            if let Obj::Class(class) = &mut self.heap.borrow_mut()[class] {
                class.static_fields.insert(name.to_string(), value);
            }
        }
    }

    pub(crate) fn is_instance(&self, value: Value, class: Value) -> Result<bool, Throw> {
        let target = match class {
            Value::Obj(id) if matches!(self.heap.borrow()[id], Obj::Class(_)) => id,
            _ => return Err(self.error("Right operand must be a class.")),
        };
        let heap = self.heap.borrow();
        let mut current = Some(self.class_of_in(&heap, value));
        while let Some(id) = current {
            if id == target {
                return Ok(true);
            }
            current = match &heap[id] {
                Obj::Class(class) => class.superclass,
                _ => None,
            };
        }
        Ok(false)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    pub fn class_of(&self, value: Value) -> ObjId {
        self.class_of_in(&self.heap.borrow(), value)
    }

    fn class_of_in(&self, heap: &Heap, value: Value) -> ObjId {
        match value {
            Value::Null => self.core.null,
            Value::Bool(_) => self.core.bool_,
            Value::Num(_) => self.core.num,
            Value::Obj(id) => match &heap[id] {
                Obj::String(_) => self.core.string,
                Obj::List(_) => self.core.list,
                Obj::Map(_) => self.core.map,
                Obj::Range(_) => self.core.range,
                Obj::Instance(instance) => instance.class,
                Obj::Class(_) => self.core.class,
                Obj::Foreign(foreign) => foreign.class,
                Obj::Fn(_) => self.core.fn_,
                Obj::Fiber(_) => self.core.fiber,
            },
        }
    }

    /// Looks up `signature` on the receiver: a class's own static methods
    /// first, then instance methods up the superclass chain.
    pub fn find_method(&self, receiver: Value, signature: &str) -> Option<Method> {
        let heap = self.heap.borrow();
        if let Value::Obj(id) = receiver {
            if let Obj::Class(class) = &heap[id] {
                if let Some(method) = class.static_methods.get(signature) {
                    return Some(method.clone());
                }
            }
        }
        find_instance_method(&heap, self.class_of_in(&heap, receiver), signature)
    }

    /// Calls `signature` with `args[0]` as the receiver.
    pub fn invoke(&self, signature: &str, args: &[Value]) -> Result<Value, Throw> {
        match self.find_method(args[0], signature) {
            Some(method) => self.run_method(method, args),
            None => Err(self.no_such_method(args[0], signature)),
        }
    }

    fn invoke_super(&self, ctx: &Closure, signature: &str, args: &[Value]) -> Result<Value, Throw> {
        let method = ctx.class.and_then(|class| {
            let heap = self.heap.borrow();
            let Obj::Class(class) = &heap[class] else {
                return None;
            };
            let superclass = class.superclass?;
            let is_static = matches!(args[0], Value::Obj(id) if matches!(heap[id], Obj::Class(_)));
            if is_static {
                if let Obj::Class(parent) = &heap[superclass] {
                    if let Some(method) = parent.static_methods.get(signature) {
                        return Some(method.clone());
                    }
                }
            }
            find_instance_method(&heap, superclass, signature)
        });
        match method {
            Some(method) => self.run_method(method, args),
            None => Err(self.error(format!("Superclass does not implement '{signature}'."))),
        }
    }

    fn run_method(&self, method: Method, args: &[Value]) -> Result<Value, Throw> {
        let depth = self.depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(self.error("Stack overflow."));
        }
        self.depth.set(depth + 1);
        let result = match method {
            Method::Primitive(primitive) => primitive(self, args),
            Method::Foreign(function) => self.call_foreign(function, args),
            Method::Block { decl, module, class } => {
                self.call_block_method(decl, module, class, args)
            }
            Method::Constructor { init } => self.construct(args, &init),
        };
        self.depth.set(depth);
        result
    }

    fn call_block_method(
        &self,
        decl: Rc<MethodDecl>,
        module: Rc<Module>,
        class: ObjId,
        args: &[Value],
    ) -> Result<Value, Throw> {
        let Some(body) = decl.body.as_ref() else {
            return Err(self.error(format!("Method '{}' has no body.", decl.signature)));
        };
        let env = Env::new(None);
        {
            let mut vars = env.vars.borrow_mut();
            for (param, value) in decl.params.iter().zip(args.iter().skip(1)) {
                vars.insert(param.clone(), *value);
            }
        }
        let ctx = Closure {
            module: module.clone(),
            env: Some(env),
            this: Some(args[0]),
            class: Some(class),
        };
        self.enter_frame(
            module,
            FrameKind::Method {
                class,
                decl: decl.clone(),
            },
            decl.line,
        )?;
        let result = self.exec_body(body, &ctx);
        self.leave_frame();
        result
    }

    fn exec_body(&self, body: &Body, ctx: &Closure) -> Result<Value, Throw> {
        if body.is_expression {
            if let Some(Stmt {
                kind: StmtKind::Expr(expr),
                line,
            }) = body.stmts.first()
            {
                self.set_line(*line);
                return self.eval(expr, ctx);
            }
        }
        match self.exec_stmts(&body.stmts, ctx)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    fn construct(&self, args: &[Value], init: &str) -> Result<Value, Throw> {
        let Value::Obj(class_id) = args[0] else {
            return Err(self.error("Constructors must be called on a class."));
        };
        let (name, is_foreign, allocate) = match &self.heap.borrow()[class_id] {
            Obj::Class(class) => (class.name.clone(), class.is_foreign, class.allocate),
            _ => return Err(self.error("Constructors must be called on a class.")),
        };

        let instance = if is_foreign {
            let Some(allocate) = allocate else {
                return Err(self.error(format!("Foreign class '{name}' has no allocator.")));
            };
            let created = self.call_foreign(allocate, args)?;
            let is_foreign_object = match created {
                Value::Obj(id) => {
                    matches!(&self.heap.borrow()[id], Obj::Foreign(f) if f.class == class_id)
                }
                _ => false,
            };
            if !is_foreign_object {
                return Err(self.error(format!(
                    "Allocator for foreign class '{name}' did not create an instance."
                )));
            }
            created
        } else {
            self.alloc(Obj::Instance(InstanceObj {
                class: class_id,
                fields: FxHashMap::default(),
            }))
        };

        let mut argv = args.to_vec();
        argv[0] = instance;
        self.invoke(init, &argv)?;
        Ok(instance)
    }

    /// Runs a host function with `args` as its slots and returns slot 0.
    pub(crate) fn call_foreign(
        &self,
        function: QuillForeignMethodFn,
        args: &[Value],
    ) -> Result<Value, Throw> {
        let saved_slots = self.slots.replace(args.to_vec());
        let saved_abort = self.pending_abort.take();
        unsafe { function(self.as_raw()) };
        let slots = self.slots.replace(saved_slots);
        if let Some(error) = self.pending_abort.replace(saved_abort) {
            return Err(self.throw(error));
        }
        Ok(slots.first().copied().unwrap_or(Value::Null))
    }

    /// Calls a function object with the given arguments.
    pub(crate) fn call_fn(&self, function: Value, args: &[Value]) -> Result<Value, Throw> {
        let (decl, closure) = match function {
            Value::Obj(id) => match &self.heap.borrow()[id] {
                Obj::Fn(function) => (function.decl.clone(), function.closure.clone()),
                _ => return Err(self.error("Value is not a function.")),
            },
            _ => return Err(self.error("Value is not a function.")),
        };
        if args.len() < decl.params.len() {
            return Err(self.error("Function expects more arguments."));
        }
        let env = Env::new(closure.env.clone());
        {
            let mut vars = env.vars.borrow_mut();
            for (param, value) in decl.params.iter().zip(args) {
                vars.insert(param.clone(), *value);
            }
        }
        let ctx = Closure {
            env: Some(env),
            ..closure
        };
        self.enter_frame(ctx.module.clone(), FrameKind::Fn, decl.line)?;
        let result = self.exec_body(&decl.body, &ctx);
        self.leave_frame();
        result
    }

    /// Runs a fiber to completion. With `catch`, an error becomes the result.
    pub(crate) fn run_fiber(
        &self,
        fiber: ObjId,
        args: &[Value],
        catch: bool,
    ) -> Result<Value, Throw> {
        let func = {
            let mut heap = self.heap.borrow_mut();
            match &mut heap[fiber] {
                Obj::Fiber(state) => match state.state {
                    FiberState::New => {
                        state.state = FiberState::Running;
                        Ok(state.func)
                    }
                    FiberState::Running => Err("Fiber has already been called."),
                    FiberState::Done => Err("Cannot call a finished fiber."),
                },
                _ => Err("Receiver must be a fiber."),
            }
        };
        let func = func.map_err(|message| self.error(message))?;

        let frames = self.frames.borrow().len();
        let depth = self.depth.get();
        let result = self.call_fn(Value::Obj(func), args);
        self.frames.borrow_mut().truncate(frames);
        self.depth.set(depth);

        let error = result.as_ref().err().map(|throw| throw.value);
        if let Obj::Fiber(state) = &mut self.heap.borrow_mut()[fiber] {
            state.state = FiberState::Done;
            if let Some(error) = error {
                state.error = error;
            }
        }
        match result {
            Err(throw) if catch => Ok(throw.value),
            other => other,
        }
    }

    fn no_such_method(&self, receiver: Value, signature: &str) -> Throw {
        let description = {
            let heap = self.heap.borrow();
            match receiver {
                Value::Obj(id) => match &heap[id] {
                    Obj::Class(class) => format!("{} metaclass", class.name),
                    _ => class_name(&heap, self.class_of_in(&heap, receiver)),
                },
                _ => class_name(&heap, self.class_of_in(&heap, receiver)),
            }
        };
        self.error(format!("{description} does not implement '{signature}'."))
    }

    // ========================================================================
    // Errors and stack frames
    // ========================================================================

    fn enter_frame(&self, module: Rc<Module>, kind: FrameKind, line: u32) -> Result<(), Throw> {
        if self.frames.borrow().len() >= MAX_CALL_DEPTH {
            return Err(self.error("Stack overflow."));
        }
        self.frames.borrow_mut().push(Frame { module, kind, line });
        Ok(())
    }

    fn leave_frame(&self) {
        self.frames.borrow_mut().pop();
    }

    fn set_line(&self, line: u32) {
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.line = line;
        }
    }

    /// Builds an error whose value is the string `message`.
    pub fn error(&self, message: impl Into<String>) -> Throw {
        let value = self.new_string(message.into().into_bytes());
        self.throw(value)
    }

    pub(crate) fn throw(&self, value: Value) -> Throw {
        Throw {
            value,
            trace: self.stack_trace(),
        }
    }

    fn stack_trace(&self) -> Vec<TraceFrame> {
        let frames = self.frames.borrow();
        let heap = self.heap.borrow();
        frames
            .iter()
            .rev()
            .map(|frame| TraceFrame {
                module: frame.module.name.clone(),
                line: frame.line,
                function: match &frame.kind {
                    FrameKind::Script => "(script)".to_string(),
                    FrameKind::Fn => "(fn)".to_string(),
                    FrameKind::Method { class, decl } => {
                        format!("{}.{}", class_name(&heap, *class), decl.signature)
                    }
                },
            })
            .collect()
    }

    /// The text reported for an uncaught error value.
    pub fn error_message(&self, value: Value) -> String {
        match self.string_bytes(value) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => "[error object]".to_string(),
        }
    }

    fn report_runtime_error(&self, throw: &Throw) {
        let message = self.error_message(throw.value);
        self.report_error(QuillErrorType::Runtime, None, -1, &message);
        for frame in &throw.trace {
            self.report_error(
                QuillErrorType::StackTrace,
                Some(&frame.module),
                frame.line as i32,
                &frame.function,
            );
        }
    }

    pub(crate) fn report_error(
        &self,
        kind: QuillErrorType,
        module: Option<&str>,
        line: i32,
        message: &str,
    ) {
        let Some(error_fn) = self.config.error_fn else {
            return;
        };
        let module = module.map(|m| to_cstring(m.as_bytes()));
        let message = to_cstring(message.as_bytes());
        unsafe {
            error_fn(
                self.as_raw(),
                kind,
                module.as_ref().map_or(std::ptr::null(), |m| m.as_ptr()),
                line,
                message.as_ptr(),
            );
        }
    }

    /// Sends text to the host's write callback.
    pub(crate) fn write(&self, text: &[u8]) {
        if let Some(write_fn) = self.config.write_fn {
            let text = to_cstring(text);
            unsafe { write_fn(self.as_raw(), text.as_ptr()) };
        }
    }

    // ========================================================================
    // Values
    // ========================================================================

    pub(crate) fn alloc(&self, obj: Obj) -> Value {
        Value::Obj(self.heap.borrow_mut().alloc(obj))
    }

    pub fn new_string(&self, bytes: Vec<u8>) -> Value {
        self.alloc(Obj::String(bytes))
    }

    /// A copy of the bytes of a string value.
    pub fn string_bytes(&self, value: Value) -> Option<Vec<u8>> {
        let id = value.as_obj()?;
        match &self.heap.borrow()[id] {
            Obj::String(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Structural equality for value types, identity for everything else.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => {
                if a == b {
                    return true;
                }
                let heap = self.heap.borrow();
                match (&heap[a], &heap[b]) {
                    (Obj::String(a), Obj::String(b)) => a == b,
                    (Obj::Range(a), Obj::Range(b)) => a == b,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// The hashable key for a value, if it may be used as a map key.
    pub fn map_key_of(&self, value: Value) -> Option<MapKey> {
        match value {
            Value::Null => Some(MapKey::Null),
            Value::Bool(b) => Some(MapKey::Bool(b)),
            Value::Num(n) => Some(MapKey::num(n)),
            Value::Obj(id) => match &self.heap.borrow()[id] {
                Obj::String(bytes) => Some(MapKey::Str(bytes.clone())),
                Obj::Class(_) => Some(MapKey::Class(id)),
                Obj::Range(range) => Some(MapKey::Range(
                    range.from.to_bits(),
                    range.to.to_bits(),
                    range.inclusive,
                )),
                _ => None,
            },
        }
    }

    pub(crate) fn map_key(&self, value: Value) -> Result<MapKey, Throw> {
        self.map_key_of(value)
            .ok_or_else(|| self.error("Key must be a value type."))
    }

    /// Calls `toString` and returns the resulting bytes.
    pub(crate) fn stringify(&self, value: Value) -> Result<Vec<u8>, Throw> {
        if let Some(bytes) = self.string_bytes(value) {
            return Ok(bytes);
        }
        let result = self.invoke("toString", &[value])?;
        Ok(self
            .string_bytes(result)
            .unwrap_or_else(|| b"[invalid toString]".to_vec()))
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Collects now when idle; otherwise at the end of the current run.
    pub fn collect_garbage(&self) {
        if self.running.get() {
            self.gc_requested.set(true);
            return;
        }
        let roots = self.roots();
        let finalizers = self.heap.borrow_mut().collect(&roots);
        for finalizer in finalizers {
            unsafe { finalizer.run() };
        }
    }

    pub(crate) fn request_collection(&self) {
        self.gc_requested.set(true);
    }

    fn safepoint(&self) {
        let requested = self.gc_requested.replace(false);
        if requested || self.heap.borrow().should_collect() {
            self.collect_garbage();
        }
    }

    fn roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = self.core.all().into_iter().map(Value::Obj).collect();
        roots.extend(self.core_module.vars.borrow().values().copied());
        for module in self.modules.borrow().values() {
            roots.extend(module.vars.borrow().values().copied());
        }
        roots.extend(self.slots.borrow().iter().copied());
        for handle in self.handles.borrow().iter() {
            roots.push(unsafe { (**handle).value });
        }
        roots
    }

    pub fn live_objects(&self) -> usize {
        self.heap.borrow().live_objects()
    }

    // ========================================================================
    // Slots
    // ========================================================================

    pub fn slot_count(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn ensure_slots(&self, count: usize) {
        let mut slots = self.slots.borrow_mut();
        if slots.len() < count {
            slots.resize(count, Value::Null);
        }
    }

    pub fn slot(&self, index: usize) -> Value {
        self.slots.borrow().get(index).copied().unwrap_or(Value::Null)
    }

    pub fn set_slot(&self, index: usize, value: Value) {
        let mut slots = self.slots.borrow_mut();
        if slots.len() <= index {
            slots.resize(index + 1, Value::Null);
        }
        slots[index] = value;
    }

    pub fn slot_type(&self, index: usize) -> QuillType {
        match self.slot(index) {
            Value::Null => QuillType::Null,
            Value::Bool(_) => QuillType::Bool,
            Value::Num(_) => QuillType::Num,
            Value::Obj(id) => match &self.heap.borrow()[id] {
                Obj::String(_) => QuillType::String,
                Obj::List(_) => QuillType::List,
                Obj::Map(_) => QuillType::Map,
                Obj::Foreign(_) => QuillType::Foreign,
                _ => QuillType::Unknown,
            },
        }
    }

    /// Pointer and length of a string slot's bytes, valid until the next collection.
    pub fn slot_bytes_raw(&self, index: usize) -> Option<(*const u8, usize)> {
        let id = self.slot(index).as_obj()?;
        match &self.heap.borrow()[id] {
            Obj::String(bytes) => Some((bytes.as_ptr(), bytes.len())),
            _ => None,
        }
    }

    pub fn new_foreign(&self, slot: usize, class_slot: usize, size: usize) -> *mut c_void {
        let class = match self.slot(class_slot) {
            Value::Obj(id) if matches!(&self.heap.borrow()[id], Obj::Class(c) if c.is_foreign) => {
                id
            }
            _ => return std::ptr::null_mut(),
        };
        let words = size.div_ceil(8).max(1);
        let mut data = vec![0u64; words].into_boxed_slice();
        let ptr = data.as_mut_ptr().cast::<c_void>();
        let value = self.alloc(Obj::Foreign(ForeignObj { class, data }));
        self.set_slot(slot, value);
        ptr
    }

    pub fn slot_foreign(&self, index: usize) -> *mut c_void {
        let Some(id) = self.slot(index).as_obj() else {
            return std::ptr::null_mut();
        };
        match &mut self.heap.borrow_mut()[id] {
            Obj::Foreign(foreign) => foreign.data.as_mut_ptr().cast(),
            _ => std::ptr::null_mut(),
        }
    }

    /// Records an error to raise in the current fiber once the foreign call returns.
    pub fn abort_fiber(&self, slot: usize) {
        self.pending_abort.set(Some(self.slot(slot)));
    }

    // ========================================================================
    // Lists and maps
    // ========================================================================

    pub fn list_count(&self, slot: usize) -> usize {
        self.with_list(slot, |items| items.len()).unwrap_or(0)
    }

    pub fn list_get(&self, list_slot: usize, index: isize, element_slot: usize) -> bool {
        let element = self
            .with_list(list_slot, |items| {
                normalize_index(index, items.len()).map(|i| items[i])
            })
            .flatten();
        match element {
            Some(value) => {
                self.set_slot(element_slot, value);
                true
            }
            None => false,
        }
    }

    pub fn list_set(&self, list_slot: usize, index: isize, element_slot: usize) -> bool {
        let value = self.slot(element_slot);
        self.with_list_mut(list_slot, |items| match normalize_index(index, items.len()) {
            Some(i) => {
                items[i] = value;
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Inserts before `index`; negative indices count back from one past the end.
    pub fn list_insert(&self, list_slot: usize, index: isize, element_slot: usize) -> bool {
        let value = self.slot(element_slot);
        self.with_list_mut(list_slot, |items| {
            let len = items.len() as isize;
            let position = if index < 0 { len + 1 + index } else { index };
            if (0..=len).contains(&position) {
                items.insert(position as usize, value);
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    pub fn map_count(&self, slot: usize) -> usize {
        let Some(id) = self.slot(slot).as_obj() else {
            return 0;
        };
        match &self.heap.borrow()[id] {
            Obj::Map(map) => map.len(),
            _ => 0,
        }
    }

    pub fn map_contains(&self, map_slot: usize, key_slot: usize) -> bool {
        let Some(key) = self.map_key_of(self.slot(key_slot)) else {
            return false;
        };
        let Some(id) = self.slot(map_slot).as_obj() else {
            return false;
        };
        match &self.heap.borrow()[id] {
            Obj::Map(map) => map.contains_key(&key),
            _ => false,
        }
    }

    pub fn map_get(&self, map_slot: usize, key_slot: usize, value_slot: usize) -> bool {
        let Some(key) = self.map_key_of(self.slot(key_slot)) else {
            return false;
        };
        let Some(id) = self.slot(map_slot).as_obj() else {
            return false;
        };
        let value = match &self.heap.borrow()[id] {
            Obj::Map(map) => map.get(&key).map(|(_, value)| *value),
            _ => None,
        };
        self.set_slot(value_slot, value.unwrap_or(Value::Null));
        value.is_some()
    }

    pub fn map_set(&self, map_slot: usize, key_slot: usize, value_slot: usize) -> bool {
        let key_value = self.slot(key_slot);
        let Some(key) = self.map_key_of(key_value) else {
            return false;
        };
        let value = self.slot(value_slot);
        let Some(id) = self.slot(map_slot).as_obj() else {
            return false;
        };
        match &mut self.heap.borrow_mut()[id] {
            Obj::Map(map) => {
                map.insert(key, (key_value, value));
                true
            }
            _ => false,
        }
    }

    pub fn map_remove(
        &self,
        map_slot: usize,
        key_slot: usize,
        removed_slot: Option<usize>,
    ) -> bool {
        let Some(key) = self.map_key_of(self.slot(key_slot)) else {
            return false;
        };
        let Some(id) = self.slot(map_slot).as_obj() else {
            return false;
        };
        let removed = match &mut self.heap.borrow_mut()[id] {
            Obj::Map(map) => map.remove(&key).map(|(_, value)| value),
            _ => None,
        };
        if let Some(slot) = removed_slot {
            self.set_slot(slot, removed.unwrap_or(Value::Null));
        }
        removed.is_some()
    }

    fn with_list<R>(&self, slot: usize, f: impl FnOnce(&Vec<Value>) -> R) -> Option<R> {
        let id = self.slot(slot).as_obj()?;
        match &self.heap.borrow()[id] {
            Obj::List(items) => Some(f(items)),
            _ => None,
        }
    }

    fn with_list_mut<R>(&self, slot: usize, f: impl FnOnce(&mut Vec<Value>) -> R) -> Option<R> {
        let id = self.slot(slot).as_obj()?;
        match &mut self.heap.borrow_mut()[id] {
            Obj::List(items) => Some(f(items)),
            _ => None,
        }
    }

    // ========================================================================
    // Handles
    // ========================================================================

    pub fn make_handle(&self, value: Value, signature: Option<String>) -> *mut QuillHandle {
        let raw = Box::into_raw(Box::new(HandleData { value, signature }));
        self.handles.borrow_mut().insert(raw);
        raw.cast()
    }

    pub fn handle_value(&self, handle: *mut QuillHandle) -> Option<Value> {
        let raw = handle.cast::<HandleData>();
        if self.handles.borrow().contains(&raw) {
            Some(unsafe { (*raw).value })
        } else {
            None
        }
    }

    fn handle_signature(&self, handle: *mut QuillHandle) -> Option<String> {
        let raw = handle.cast::<HandleData>();
        if self.handles.borrow().contains(&raw) {
            unsafe { (*raw).signature.clone() }
        } else {
            None
        }
    }

    /// Frees a handle. Unknown or already-released handles are ignored.
    pub fn release_handle(&self, handle: *mut QuillHandle) {
        let raw = handle.cast::<HandleData>();
        if self.handles.borrow_mut().remove(&raw) {
            drop(unsafe { Box::from_raw(raw) });
        }
    }

    pub fn live_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    /// Looks up a module variable into `slot`.
    pub fn load_variable(&self, module: &str, name: &str, slot: usize) -> bool {
        match self.module_variable(module, name) {
            Some(value) => {
                self.set_slot(slot, value);
                true
            }
            None => false,
        }
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        for raw in self.handles.get_mut().drain() {
            drop(unsafe { Box::from_raw(raw) });
        }
        let finalizers = self.heap.get_mut().teardown();
        for finalizer in finalizers {
            unsafe { finalizer.run() };
        }
    }
}

pub(crate) fn find_instance_method(heap: &Heap, class: ObjId, signature: &str) -> Option<Method> {
    let mut current = Some(class);
    while let Some(id) = current {
        let Obj::Class(class) = &heap[id] else {
            return None;
        };
        if let Some(method) = class.methods.get(signature) {
            return Some(method.clone());
        }
        current = class.superclass;
    }
    None
}

pub(crate) fn class_name(heap: &Heap, class: ObjId) -> String {
    match &heap[class] {
        Obj::Class(class) => class.name.clone(),
        _ => "?".to_string(),
    }
}

/// Resolves a possibly negative index against `len`.
pub(crate) fn normalize_index(index: isize, len: usize) -> Option<usize> {
    let index = if index < 0 { len as isize + index } else { index };
    (0..len as isize).contains(&index).then_some(index as usize)
}

fn starts_lowercase(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}

/// Copies text into a C string, dropping interior NUL bytes.
pub(crate) fn to_cstring(bytes: &[u8]) -> CString {
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|b| *b != 0).collect();
    CString::new(cleaned).unwrap_or_default()
}

/// Copies a host-owned string and hands it back to the host for release.
unsafe fn take_host_string(host: QuillHostString) -> Option<String> {
    if host.text.is_null() {
        return None;
    }
    let text = CStr::from_ptr(host.text).to_string_lossy().into_owned();
    if let Some(release) = host.release {
        release(host.text);
    }
    Some(text)
}
