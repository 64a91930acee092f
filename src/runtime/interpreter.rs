//! CIL interpreter for the runtime host.
//!
//! The [`Interpreter`] executes method bodies from the runtime's live method table one
//! instruction at a time. Each [`Interpreter::step`] returns a [`StepResult`] telling
//! the dispatch loop whether to continue, branch, enter a callee or return; managed
//! calls push a [`Frame`] instead of recursing, so deep call chains are bounded by
//! [`crate::runtime::RuntimeLimits::max_call_depth`] rather than the Rust stack.
//!
//! Member references are dispatched to the runtime's
//! [`crate::runtime::NativeRegistry`]. Exception handling is not supported: `throw`
//! ends the invocation with [`crate::Error::Execution`].

use std::{cmp::Ordering, sync::Arc};

use crate::{
    assembly::{Immediate, Instruction, Label, Operand},
    metadata::{
        image::{AssemblyImage, TypeDefinition},
        method::{MethodBody, MethodDefinition},
        token::{TableId, Token},
        typesystem::TypeDescriptor,
    },
    runtime::{
        native::NativeCall,
        object::ObjectRef,
        value::{Pointer, Value},
        MethodKey, Runtime,
    },
    Error, Result,
};

/// Activation record of one managed call.
pub(crate) struct Frame {
    image: Arc<AssemblyImage>,
    body: Arc<MethodBody>,
    method: String,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    ip: usize,
    returns: bool,
    constructed: Option<ObjectRef>,
}

impl Frame {
    pub(crate) fn new(
        image: Arc<AssemblyImage>,
        ty: &TypeDefinition,
        method: &MethodDefinition,
        body: Arc<MethodBody>,
        args: Vec<Value>,
    ) -> Self {
        let locals = defaults(&body.locals);
        Frame {
            image,
            body,
            method: format!("{}::{}", ty.full_name(), method.name),
            args,
            locals,
            stack: Vec::with_capacity(8),
            ip: 0,
            returns: method.returns.is_some(),
            constructed: None,
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| execution_error!("stack underflow in {} at {}", self.method, self.ip))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(execution_error!(
                "stack underflow in {} at {}: need {}, have {}",
                self.method,
                self.ip,
                count,
                self.stack.len()
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn pop_object(&mut self) -> Result<ObjectRef> {
        match self.pop()? {
            Value::Object(object) => Ok(object),
            Value::Null => Err(execution_error!("null reference in {} at {}", self.method, self.ip)),
            other => Err(execution_error!("expected object, found {}", other.kind())),
        }
    }

    fn pop_pointer(&mut self) -> Result<Pointer> {
        match self.pop()? {
            Value::Ref(pointer) => Ok(pointer),
            other => Err(execution_error!("expected pointer, found {}", other.kind())),
        }
    }

    fn arg_mut(&mut self, index: u16) -> Result<&mut Value> {
        let method = &self.method;
        self.args
            .get_mut(usize::from(index))
            .ok_or_else(|| execution_error!("{} has no argument {}", method, index))
    }

    fn local_mut(&mut self, index: u16) -> Result<&mut Value> {
        let method = &self.method;
        self.locals
            .get_mut(usize::from(index))
            .ok_or_else(|| execution_error!("{} has no local {}", method, index))
    }
}

/// Outcome of a single [`Interpreter::step`].
pub(crate) enum StepResult {
    /// Fall through to the next instruction
    Continue,
    /// Transfer control to a label of the current body
    Branch(Label),
    /// Enter a managed callee
    Call(Frame),
    /// Leave the current frame
    Return(Option<Value>),
}

/// Executes managed code against a [`Runtime`].
pub(crate) struct Interpreter<'r> {
    runtime: &'r Runtime,
    frames: Vec<Frame>,
    executed: u64,
}

impl<'r> Interpreter<'r> {
    pub(crate) fn new(runtime: &'r Runtime) -> Self {
        Interpreter {
            runtime,
            frames: Vec::new(),
            executed: 0,
        }
    }

    /// Number of instructions executed so far.
    pub(crate) fn executed(&self) -> u64 {
        self.executed
    }

    /// Run `entry` to completion, returning its result.
    pub(crate) fn run(&mut self, entry: Frame) -> Result<Option<Value>> {
        let limits = self.runtime.limits().clone();
        self.frames.push(entry);

        loop {
            self.executed += 1;
            if limits.instructions_exceeded(self.executed) {
                return Err(Error::LimitExceeded(format!(
                    "more than {} instructions executed",
                    limits.max_instructions
                )));
            }

            let (body, ip) = {
                let frame = self.current()?;
                (Arc::clone(&frame.body), frame.ip)
            };
            let Some(instruction) = body.code.get(ip) else {
                return Err(execution_error!(
                    "{} ran past the end of its body",
                    self.current()?.method
                ));
            };

            match self.step(instruction)? {
                StepResult::Continue => self.current_mut()?.ip += 1,
                StepResult::Branch(label) => {
                    let target = body
                        .code
                        .label_position(label)
                        .ok_or(Error::UndefinedLabel(label.0))?;
                    self.current_mut()?.ip = target;
                }
                StepResult::Call(frame) => {
                    if self.frames.len() >= limits.max_call_depth {
                        return Err(Error::LimitExceeded(format!(
                            "call depth {} reached entering {}",
                            limits.max_call_depth, frame.method
                        )));
                    }
                    self.frames.push(frame);
                }
                StepResult::Return(value) => {
                    let finished = self
                        .frames
                        .pop()
                        .ok_or_else(|| execution_error!("return without a frame"))?;
                    let value = match finished.constructed {
                        Some(object) => Some(Value::Object(object)),
                        None => value,
                    };

                    match self.frames.last_mut() {
                        None => return Ok(value),
                        Some(caller) => {
                            if let Some(value) = value {
                                caller.push(value);
                            }
                            caller.ip += 1;
                        }
                    }
                }
            }
        }
    }

    fn current(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| execution_error!("no active frame"))
    }

    fn current_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| execution_error!("no active frame"))
    }

    /// Execute one instruction of the current frame.
    pub(crate) fn step(&mut self, instruction: &Instruction) -> Result<StepResult> {
        let depth = self.frames.len().saturating_sub(1);
        let frame = self.current_mut()?;

        if let Some(index) = instruction.loaded_argument() {
            let value = frame.arg_mut(index)?.clone();
            frame.push(value);
            return Ok(StepResult::Continue);
        }
        if let Some(index) = instruction.loaded_local() {
            let value = frame.local_mut(index)?.clone();
            frame.push(value);
            return Ok(StepResult::Continue);
        }
        if let Some(index) = instruction.stored_local() {
            let value = frame.pop()?;
            *frame.local_mut(index)? = value;
            return Ok(StepResult::Continue);
        }
        if let Some(constant) = instruction.constant() {
            #[allow(clippy::cast_possible_truncation)]
            let value = if instruction.mnemonic == "ldc.i8" {
                Value::I64(constant)
            } else {
                Value::I32(constant as i32)
            };
            frame.push(value);
            return Ok(StepResult::Continue);
        }

        match (instruction.mnemonic, &instruction.operand) {
            ("nop", _) => {}
            ("ldnull", _) => frame.push(Value::Null),
            ("ldc.r4", Operand::Immediate(Immediate::Float32(v))) => frame.push(Value::F32(*v)),
            ("ldc.r8", Operand::Immediate(Immediate::Float64(v))) => frame.push(Value::F64(*v)),
            ("dup", _) => {
                let value = frame.pop()?;
                frame.push(value.clone());
                frame.push(value);
            }
            ("pop", _) => {
                frame.pop()?;
            }
            ("starg" | "starg.s", Operand::Argument(index)) => {
                let value = frame.pop()?;
                *frame.arg_mut(*index)? = value;
            }
            ("ldarga" | "ldarga.s", Operand::Argument(index)) => {
                frame.arg_mut(*index)?;
                frame.push(Value::Ref(Pointer::Argument {
                    frame: depth,
                    index: *index,
                }));
            }
            ("ldloca" | "ldloca.s", Operand::Local(index)) => {
                frame.local_mut(*index)?;
                frame.push(Value::Ref(Pointer::Local {
                    frame: depth,
                    index: *index,
                }));
            }
            ("add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" | "shl" | "shr", _) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                frame.push(binary(instruction.mnemonic, left, right)?);
            }
            ("neg", _) => {
                let value = match frame.pop()? {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F32(v) => Value::F32(-v),
                    Value::F64(v) => Value::F64(-v),
                    other => return Err(execution_error!("neg on {}", other.kind())),
                };
                frame.push(value);
            }
            ("not", _) => {
                let value = match frame.pop()? {
                    Value::I32(v) => Value::I32(!v),
                    Value::I64(v) => Value::I64(!v),
                    other => return Err(execution_error!("not on {}", other.kind())),
                };
                frame.push(value);
            }
            ("ceq" | "cgt" | "cgt.un" | "clt" | "clt.un", _) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let base = instruction.mnemonic.trim_end_matches(".un");
                let holds = condition(base, compare(&left, &right)?, instruction.mnemonic.ends_with(".un"));
                frame.push(Value::from(holds));
            }
            ("br" | "br.s", Operand::Target(label)) => return Ok(StepResult::Branch(*label)),
            ("brtrue" | "brtrue.s" | "brfalse" | "brfalse.s", Operand::Target(label)) => {
                let taken = frame.pop()?.is_true() == instruction.mnemonic.starts_with("brtrue");
                if taken {
                    return Ok(StepResult::Branch(*label));
                }
            }
            (mnemonic, Operand::Target(label)) => {
                let right = frame.pop()?;
                let left = frame.pop()?;
                let base = mnemonic.trim_end_matches(".s");
                let unordered = base.ends_with(".un");
                let kind = base.trim_end_matches(".un").trim_start_matches('b');
                let taken = match kind {
                    "ne" => compare(&left, &right)? != Some(Ordering::Equal),
                    "eq" => compare(&left, &right)? == Some(Ordering::Equal),
                    "ge" | "gt" | "le" | "lt" => {
                        condition(kind, compare(&left, &right)?, unordered)
                    }
                    _ => return Err(execution_error!("unsupported branch {}", mnemonic)),
                };
                if taken {
                    return Ok(StepResult::Branch(*label));
                }
            }
            ("switch", Operand::Switch(labels)) => {
                let selector = frame.pop()?.as_i32()?;
                if let Some(label) = usize::try_from(selector).ok().and_then(|i| labels.get(i)) {
                    return Ok(StepResult::Branch(*label));
                }
            }
            (mnemonic, _) if mnemonic.starts_with("conv.") => {
                let value = frame.pop()?;
                frame.push(convert(&mnemonic[5..], value)?);
            }
            (mnemonic, _) if mnemonic.starts_with("ldind.") => {
                let pointer = frame.pop_pointer()?;
                let value = load(self.runtime, &self.frames, &pointer)?;
                let value = match &mnemonic[6..] {
                    "ref" => value,
                    kind => convert(kind, value)?,
                };
                self.current_mut()?.push(value);
            }
            (mnemonic, _) if mnemonic.starts_with("stind.") => {
                let value = frame.pop()?;
                let pointer = frame.pop_pointer()?;
                let value = match &mnemonic[6..] {
                    "ref" => value,
                    kind => convert(kind, value)?,
                };
                store(self.runtime, &mut self.frames, &pointer, value)?;
            }
            ("ldfld" | "ldflda" | "stfld" | "ldsfld" | "ldsflda" | "stsfld", Operand::Token(token)) => {
                self.field(instruction.mnemonic, *token)?;
            }
            ("call" | "callvirt", Operand::Token(token)) => return self.call(*token),
            ("newobj", Operand::Token(token)) => return self.new_object(*token),
            ("ret", _) => {
                let value = if frame.returns { Some(frame.pop()?) } else { None };
                return Ok(StepResult::Return(value));
            }
            ("throw", _) => {
                return Err(execution_error!("unhandled exception thrown in {}", frame.method))
            }
            (mnemonic, operand) => {
                return Err(execution_error!(
                    "unsupported instruction {} {} in {}",
                    mnemonic,
                    operand,
                    frame.method
                ))
            }
        }

        Ok(StepResult::Continue)
    }

    fn field(&mut self, mnemonic: &str, token: Token) -> Result<()> {
        let runtime = self.runtime;
        let frame = self.current_mut()?;
        let image = Arc::clone(&frame.image);
        let Some((ty, field)) = image.field_by_token(token) else {
            return Err(execution_error!("unresolved field token {} in {}", token, frame.method));
        };
        if field.is_static() != mnemonic.contains("sfld") {
            return Err(execution_error!(
                "{} used on {}.{} in {}",
                mnemonic,
                ty.full_name(),
                field.name,
                frame.method
            ));
        }

        match mnemonic {
            "ldfld" => {
                let object = frame.pop_object()?;
                frame.push(object.get(token)?);
            }
            "ldflda" => {
                let object = frame.pop_object()?;
                object.get(token)?;
                frame.push(Value::Ref(Pointer::Field {
                    object,
                    field: token,
                }));
            }
            "stfld" => {
                let value = frame.pop()?;
                let object = frame.pop_object()?;
                object.set(token, value)?;
            }
            "ldsfld" => frame.push(runtime.static_value(image.name(), token)?),
            "ldsflda" => frame.push(Value::Ref(Pointer::Static {
                module: image.name().to_string(),
                field: token,
            })),
            _ => {
                let value = frame.pop()?;
                runtime.set_static_value(image.name(), token, value)?;
            }
        }
        Ok(())
    }

    fn call(&mut self, token: Token) -> Result<StepResult> {
        let image = Arc::clone(&self.current()?.image);

        match token.table_id() {
            Some(TableId::MethodDef) => {
                let (ty, method) = image
                    .method_by_token(token)
                    .ok_or_else(|| execution_error!("unresolved method token {}", token))?;
                let args = self.current_mut()?.pop_n(method.arg_count())?;
                let frame = self.enter(&image, ty, method, args)?;
                Ok(StepResult::Call(frame))
            }
            Some(TableId::MemberRef) => {
                let reference = image
                    .member_ref(token)
                    .ok_or_else(|| execution_error!("unresolved member reference {}", token))?;
                let name = reference.full_name();
                let native = self
                    .runtime
                    .natives()
                    .get(&name)
                    .ok_or_else(|| Error::NativeNotFound(name.clone()))?;

                let count = reference.params.len() + usize::from(reference.has_this);
                let args = self.current_mut()?.pop_n(count)?;
                let result = {
                    let mut call = NativeCall::new(self.runtime, &mut self.frames, &name, args);
                    call.run(native.as_ref())?
                };

                match (&reference.returns, result) {
                    (Some(_), Some(value)) => self.current_mut()?.push(value),
                    (Some(ty), None) => {
                        return Err(execution_error!("native {} returned no {}", name, ty))
                    }
                    (None, _) => {}
                }
                Ok(StepResult::Continue)
            }
            _ => Err(execution_error!("call through unsupported token {}", token)),
        }
    }

    fn new_object(&mut self, token: Token) -> Result<StepResult> {
        let image = Arc::clone(&self.current()?.image);
        let (ty, ctor) = image
            .method_by_token(token)
            .ok_or_else(|| execution_error!("newobj through unsupported token {}", token))?;

        let object = Runtime::allocate(ty);
        let mut args = vec![Value::Object(object.clone())];
        args.extend(self.current_mut()?.pop_n(ctor.params.len())?);

        let key = MethodKey::new(image.name(), ctor.token);
        if self.runtime.method_body(&key).is_none() {
            self.current_mut()?.push(Value::Object(object));
            return Ok(StepResult::Continue);
        }

        let mut frame = self.enter(&image, ty, ctor, args)?;
        frame.constructed = Some(object);
        Ok(StepResult::Call(frame))
    }

    fn enter(
        &self,
        image: &Arc<AssemblyImage>,
        ty: &TypeDefinition,
        method: &MethodDefinition,
        args: Vec<Value>,
    ) -> Result<Frame> {
        let key = MethodKey::new(image.name(), method.token);
        let body = self.runtime.method_body(&key).ok_or_else(|| {
            execution_error!("{}::{} has no body installed", ty.full_name(), method.name)
        })?;
        Ok(Frame::new(Arc::clone(image), ty, method, body, args))
    }
}

/// Read the storage behind `pointer`.
pub(crate) fn load(runtime: &Runtime, frames: &[Frame], pointer: &Pointer) -> Result<Value> {
    match pointer {
        Pointer::Local { frame, index } => frames
            .get(*frame)
            .and_then(|f| f.locals.get(usize::from(*index)))
            .cloned()
            .ok_or_else(|| execution_error!("dangling pointer to local {} of frame {}", index, frame)),
        Pointer::Argument { frame, index } => frames
            .get(*frame)
            .and_then(|f| f.args.get(usize::from(*index)))
            .cloned()
            .ok_or_else(|| {
                execution_error!("dangling pointer to argument {} of frame {}", index, frame)
            }),
        Pointer::Field { object, field } => object.get(*field),
        Pointer::Static { module, field } => runtime.static_value(module, *field),
    }
}

/// Write the storage behind `pointer`.
pub(crate) fn store(
    runtime: &Runtime,
    frames: &mut [Frame],
    pointer: &Pointer,
    value: Value,
) -> Result<()> {
    let slot = match pointer {
        Pointer::Local { frame, index } => frames
            .get_mut(*frame)
            .and_then(|f| f.locals.get_mut(usize::from(*index))),
        Pointer::Argument { frame, index } => frames
            .get_mut(*frame)
            .and_then(|f| f.args.get_mut(usize::from(*index))),
        Pointer::Field { object, field } => return object.set(*field, value),
        Pointer::Static { module, field } => return runtime.set_static_value(module, *field, value),
    };
    let slot = slot.ok_or_else(|| execution_error!("dangling pointer {:?}", pointer))?;
    *slot = value;
    Ok(())
}

macro_rules! integer_op {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            "add" => Ok($a.wrapping_add($b)),
            "sub" => Ok($a.wrapping_sub($b)),
            "mul" => Ok($a.wrapping_mul($b)),
            "div" | "rem" if $b == 0 => Err(execution_error!("division by zero")),
            "div" => Ok($a.wrapping_div($b)),
            "rem" => Ok($a.wrapping_rem($b)),
            "and" => Ok($a & $b),
            "or" => Ok($a | $b),
            "xor" => Ok($a ^ $b),
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            "shl" => Ok($a.wrapping_shl($b as u32)),
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            "shr" => Ok($a.wrapping_shr($b as u32)),
            other => Err(execution_error!("{} is not an integer operation", other)),
        }
    };
}

macro_rules! float_op {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            "add" => Ok($a + $b),
            "sub" => Ok($a - $b),
            "mul" => Ok($a * $b),
            "div" => Ok($a / $b),
            "rem" => Ok($a % $b),
            other => Err(execution_error!("{} is not a float operation", other)),
        }
    };
}

fn binary(op: &str, left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::I32(a), Value::I32(b)) => integer_op!(op, a, b).map(Value::I32),
        (Value::I64(a), Value::I64(b)) => integer_op!(op, a, b).map(Value::I64),
        (Value::I64(a), Value::I32(b)) if op == "shl" || op == "shr" => {
            integer_op!(op, a, i64::from(b)).map(Value::I64)
        }
        (Value::F32(a), Value::F32(b)) => float_op!(op, a, b).map(Value::F32),
        (Value::F64(a), Value::F64(b)) => float_op!(op, a, b).map(Value::F64),
        (Value::F32(a), Value::F64(b)) => float_op!(op, f64::from(a), b).map(Value::F64),
        (Value::F64(a), Value::F32(b)) => float_op!(op, a, f64::from(b)).map(Value::F64),
        (a, b) => Err(execution_error!("{} on {} and {}", op, a.kind(), b.kind())),
    }
}

/// Order two stack values; `None` means unordered (NaN, or distinct references).
fn compare(left: &Value, right: &Value) -> Result<Option<Ordering>> {
    let ordering = match (left, right) {
        (Value::I32(a), Value::I32(b)) => Some(a.cmp(b)),
        (Value::I64(a), Value::I64(b)) => Some(a.cmp(b)),
        (Value::I32(a), Value::I64(b)) => Some(i64::from(*a).cmp(b)),
        (Value::I64(a), Value::I32(b)) => Some(a.cmp(&i64::from(*b))),
        (Value::F32(_) | Value::F64(_), Value::F32(_) | Value::F64(_)) => {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::Null | Value::Object(_), Value::Null | Value::Object(_)) => {
            (left == right).then_some(Ordering::Equal)
        }
        (a, b) => return Err(execution_error!("cannot compare {} and {}", a.kind(), b.kind())),
    };
    Ok(ordering)
}

/// Evaluate `ge`/`gt`/`le`/`lt`/`eq`/`ceq`/`cgt`/`clt` on an ordering.
///
/// The unsigned variants also hold for unordered operands. Integer operands are
/// compared signed in both cases.
fn condition(kind: &str, ordering: Option<Ordering>, unordered: bool) -> bool {
    let Some(ordering) = ordering else {
        return unordered;
    };
    match kind.trim_start_matches('c') {
        "eq" => ordering == Ordering::Equal,
        "gt" => ordering == Ordering::Greater,
        "ge" => ordering != Ordering::Less,
        "lt" => ordering == Ordering::Less,
        "le" => ordering != Ordering::Greater,
        _ => false,
    }
}

fn integer(value: &Value) -> Result<i64> {
    #[allow(clippy::cast_possible_truncation)]
    match value {
        Value::I32(v) => Ok(i64::from(*v)),
        Value::I64(v) => Ok(*v),
        Value::F32(v) => Ok(*v as i64),
        Value::F64(v) => Ok(*v as i64),
        other => Err(execution_error!("cannot convert {} to an integer", other.kind())),
    }
}

/// Apply a `conv.<kind>` conversion.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
fn convert(kind: &str, value: Value) -> Result<Value> {
    let converted = match kind {
        "r4" => match value {
            Value::F32(v) => Value::F32(v),
            Value::F64(v) => Value::F32(v as f32),
            other => Value::F32(integer(&other)? as f32),
        },
        "r8" => match value {
            Value::F32(v) => Value::F64(f64::from(v)),
            Value::F64(v) => Value::F64(v),
            other => Value::F64(integer(&other)? as f64),
        },
        "i8" => Value::I64(integer(&value)?),
        "u8" => match value {
            Value::I32(v) => Value::I64(i64::from(v as u32)),
            other => Value::I64(integer(&other)?),
        },
        "i1" => Value::I32(i32::from(integer(&value)? as i8)),
        "u1" => Value::I32(i32::from(integer(&value)? as u8)),
        "i2" => Value::I32(i32::from(integer(&value)? as i16)),
        "u2" => Value::I32(i32::from(integer(&value)? as u16)),
        "i4" | "u4" => Value::I32(integer(&value)? as i32),
        other => return Err(execution_error!("unsupported conversion to {}", other)),
    };
    Ok(converted)
}

/// Zero values for a list of declared types.
pub(crate) fn defaults(types: &[TypeDescriptor]) -> Vec<Value> {
    types.iter().map(Value::default_for).collect()
}
