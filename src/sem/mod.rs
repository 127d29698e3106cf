//! Resolved semantic model consumed from the front end.
//!
//! The resolver hands the lowering core plain descriptors: every name that
//! matters has already been bound, every type already checked. This module
//! only describes the shapes; producing them is the front end's job.

use core::fmt;
use std::ops::Range;

use educe::Educe;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Span {
    pub from: usize,
    pub to: usize,
}

impl Span {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }
}

impl From<Span> for Range<usize> {
    fn from(val: Span) -> Self {
        val.from..val.to
    }
}

/// Package-qualified class name, e.g. `stm.runtime.Stm`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct QualifiedName {
    pub package: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(package: &str, name: &str) -> Self {
        Self {
            package: package.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.package.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.package, self.name)
        }
    }
}

/// A compile-time constant value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Unit,
    Bool(bool),
    Int(i64),
    Float(String),
    Str(String),
}

/// A resolved type as reported by the front end.
///
/// Spans only say where the type was written down, so they are ignored for
/// equality and hashing (resolved types are memoized by structure).
#[derive(Clone, Debug, Educe)]
#[educe(PartialEq, Eq, Hash)]
pub enum SemType {
    Unit,
    Bool,
    Int,
    Float,
    String,
    Class {
        name: QualifiedName,
        #[educe(PartialEq(ignore), Hash(ignore))]
        span: Span,
    },
    Nullable(Box<SemType>),
}

impl fmt::Display for SemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemType::Unit => write!(f, "()"),
            SemType::Bool => write!(f, "bool"),
            SemType::Int => write!(f, "int"),
            SemType::Float => write!(f, "float"),
            SemType::String => write!(f, "string"),
            SemType::Class { name, .. } => write!(f, "{name}"),
            SemType::Nullable(inner) => write!(f, "{inner}?"),
        }
    }
}

/// An enclosing-scope value captured by a script, surfaced as an implicit
/// receiver parameter.
#[derive(Debug, Clone)]
pub struct CapturedValueDescriptor {
    pub name: String,
    pub ty: SemType,
    pub span: Span,
}

/// A constructor-like input of a script, or a parameter of a member function.
#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub name: String,
    pub ty: SemType,
    pub span: Span,
    pub default_value: Option<SemExpr>,
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub ty: SemType,
    pub mutable: bool,
    pub span: Span,
    pub initializer: Option<SemExpr>,
}

#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<ParameterDescriptor>,
    pub ret_ty: SemType,
    pub is_override: bool,
    pub span: Span,
    pub body: Vec<SemStatement>,
}

/// A member declared inside a script.
#[derive(Debug, Clone)]
pub enum MemberDescriptor {
    Property(PropertyDescriptor),
    Function(FunctionDescriptor),
}

/// A resolved script: top-level statements grouped as if they were a class.
#[derive(Debug, Clone)]
pub struct ScriptDescriptor {
    pub name: String,
    pub span: Span,
    /// Enclosing-scope values the resolver captured, one implicit receiver each.
    pub implicit_receivers: Vec<CapturedValueDescriptor>,
    /// Constructor-like inputs.
    pub call_parameters: Vec<ParameterDescriptor>,
    /// Properties injected by the embedding environment.
    pub provided_properties: Vec<PropertyDescriptor>,
    pub members: Vec<MemberDescriptor>,
    /// Top-level executable statements, in source order.
    pub statements: Vec<SemStatement>,
    /// The script's trailing-expression result, if it produces one.
    pub result_value: Option<PropertyDescriptor>,
}

#[derive(Debug, Clone)]
pub enum SemStatement {
    Expr(SemExpr),
    Return(SemExpr),
}

/// A resolved expression. Names are plain strings: the resolver has already
/// guaranteed they bind inside the scope the expression appears in.
#[derive(Debug, Clone)]
pub enum SemExpr {
    Literal {
        value: ConstValue,
        span: Span,
    },
    Name {
        name: String,
        span: Span,
    },
    GetMember {
        receiver: Box<SemExpr>,
        name: String,
        span: Span,
    },
    SetMember {
        receiver: Box<SemExpr>,
        name: String,
        value: Box<SemExpr>,
        span: Span,
    },
    Call {
        target: String,
        receiver: Option<Box<SemExpr>>,
        args: Vec<SemExpr>,
        span: Span,
    },
}

impl SemExpr {
    pub fn span(&self) -> Span {
        match self {
            SemExpr::Literal { span, .. }
            | SemExpr::Name { span, .. }
            | SemExpr::GetMember { span, .. }
            | SemExpr::SetMember { span, .. }
            | SemExpr::Call { span, .. } => *span,
        }
    }
}
