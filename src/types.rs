use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{error::Error, fmt, sync::Arc};

/// Checks, and may transform, one value crossing the wire.
///
/// The error string is passed through verbatim as the call's failure message.
pub trait Validator: Send + Sync {
    fn validate(&self, value: Value) -> Result<Value, String>;
}

impl<F> Validator for F
where
    F: Fn(Value) -> Result<Value, String> + Send + Sync,
{
    fn validate(&self, value: Value) -> Result<Value, String> {
        self(value)
    }
}

/// Structural type checker usable as a [`Validator`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Type {
    Nil,
    Bool,
    Int,
    Float,
    String,
    OneOf(Vec<String>),
    Array(Box<Type>),
    Object,
    Any,
}

impl Type {
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Type::OneOf(values.into_iter().map(Into::into).collect())
    }

    pub fn array(item: Type) -> Self {
        Type::Array(Box::new(item))
    }

    pub fn of<T: Typed>() -> Self {
        T::rpc_type()
    }

    fn name(&self) -> &'static str {
        use Type::*;
        match self {
            Nil => "Nil",
            Bool => "Bool",
            Int => "Int",
            Float => "Float",
            String => "String",
            OneOf(_) => "OneOf",
            Array(_) => "Array",
            Object => "Object",
            Any => "Any",
        }
    }

    pub fn check(&self, value: &Value) -> Result<(), TypeMismatch> {
        let matches = match (self, value) {
            (Type::Any, _) => true,
            (Type::Nil, Value::Null) => true,
            (Type::Bool, Value::Bool(_)) => true,
            (Type::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Type::Float, Value::Number(_)) => true,
            (Type::String, Value::String(_)) => true,
            (Type::OneOf(options), Value::String(s)) => options.iter().any(|o| o == s),
            (Type::Array(item), Value::Array(items)) => {
                return items.iter().try_for_each(|v| item.check(v));
            }
            (Type::Object, Value::Object(_)) => true,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(TypeMismatch::new(value.clone(), self.clone()))
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())?;
        match self {
            Type::OneOf(values) => write!(f, "({})", values.join(", ")),
            Type::Array(item) => write!(f, "<{item}>"),
            _ => Ok(()),
        }
    }
}

impl Validator for Type {
    fn validate(&self, value: Value) -> Result<Value, String> {
        self.check(&value).map_err(|e| e.to_string())?;
        Ok(value)
    }
}

pub trait Typed {
    fn rpc_type() -> Type;
}

macro_rules! impl_typed {
    ($($rust_type:ty => $rpc_type:expr),* $(,)?) => {
        $(
            impl Typed for $rust_type {
                fn rpc_type() -> Type {
                    $rpc_type
                }
            }
        )*
    };
}

impl_typed!(
    () => Type::Nil,
    bool => Type::Bool,
    i32 => Type::Int,
    i64 => Type::Int,
    u32 => Type::Int,
    u64 => Type::Int,
    f32 => Type::Float,
    f64 => Type::Float,
    String => Type::String,
    &str => Type::String,
    Value => Type::Any,
);

impl<T: Typed> Typed for Vec<T> {
    fn rpc_type() -> Type {
        Type::array(T::rpc_type())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMismatch {
    value: Value,
    expected_type: Type,
}

impl TypeMismatch {
    fn new(value: Value, expected_type: Type) -> Self {
        Self {
            value,
            expected_type,
        }
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Type error: {} :/: {}", self.value, self.expected_type)
    }
}

impl Error for TypeMismatch {}

/// Positional input validators and an output validator for one RPC.
///
/// Either side may be left undeclared, in which case values pass through.
#[derive(Clone, Default)]
pub struct Schema {
    input: Option<Vec<Arc<dyn Validator>>>,
    output: Option<Arc<dyn Validator>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the full argument list. Arity is enforced from here on.
    pub fn input(mut self, validators: Vec<Arc<dyn Validator>>) -> Self {
        self.input = Some(validators);
        self
    }

    /// Append one argument validator.
    pub fn arg(mut self, validator: impl Validator + 'static) -> Self {
        self.input
            .get_or_insert_with(Vec::new)
            .push(Arc::new(validator));
        self
    }

    pub fn output(mut self, validator: impl Validator + 'static) -> Self {
        self.output = Some(Arc::new(validator));
        self
    }

    pub fn arity(&self) -> Option<usize> {
        self.input.as_ref().map(Vec::len)
    }

    pub fn validate_input(&self, args: Vec<Value>) -> Result<Vec<Value>, RpcError> {
        let Some(validators) = &self.input else {
            return Ok(args);
        };
        if validators.len() != args.len() {
            return Err(RpcError::InvalidArguments);
        }
        validators
            .iter()
            .zip(args)
            .map(|(validator, arg)| validator.validate(arg).map_err(RpcError::Validation))
            .collect()
    }

    pub fn validate_output(&self, value: Value) -> Result<Value, RpcError> {
        match &self.output {
            Some(validator) => validator.validate(value).map_err(RpcError::Validation),
            None => Ok(value),
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("arity", &self.arity())
            .field("output", &self.output.is_some())
            .finish()
    }
}
