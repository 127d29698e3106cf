use std::{collections::HashMap, path::PathBuf};

use itertools::Itertools;
use typed_generational_arena::{SmallSlab, SmallSlabIndex};

pub mod builders;
pub mod lowering;

pub use crate::sem::{ConstValue, QualifiedName, Span};

pub type DeclIndex = SmallSlabIndex<Option<Declaration>>;
pub type TypeIndex = SmallSlabIndex<Option<Type>>;
pub type ModuleIndex = SmallSlabIndex<ModuleBody>;

pub type Declarations = SmallSlab<Option<Declaration>>;
pub type Types = SmallSlab<Option<Type>>;
pub type Modules = SmallSlab<ModuleBody>;

/// Holds all the IR structures of one compilation unit.
///
/// Declarations and types live in flat arenas and reference each other by
/// index; a `DeclIndex` is the identity of a declaration, independent of
/// where the declaration currently sits in the tree. A `None` slot is
/// reserved but not yet filled, which is how the deep-copy machinery
/// pre-allocates copy targets.
#[derive(Debug, Clone)]
pub struct IrUnit {
    pub decls: Declarations,
    pub types: Types,
    pub modules: Modules,
    /// The modules of this unit, in lowering order.
    pub top_level_modules: Vec<ModuleIndex>,
    pub builtin_types: HashMap<Type, TypeIndex>,
    /// The universal base class every class ultimately inherits from.
    pub any_class: DeclIndex,
}

impl IrUnit {
    pub fn get_decl(&self, idx: DeclIndex) -> &Declaration {
        self.decls[idx].as_ref().unwrap()
    }

    pub fn get_decl_mut(&mut self, idx: DeclIndex) -> &mut Declaration {
        self.decls[idx].as_mut().unwrap()
    }

    pub fn get_type(&self, idx: TypeIndex) -> &Type {
        self.types[idx].as_ref().unwrap()
    }

    /// Get the builtin `unit` type.
    pub fn get_unit_ty(&self) -> TypeIndex {
        *self.builtin_types.get(&Type::Unit).unwrap()
    }

    /// Get the builtin `bool` type.
    pub fn get_bool_ty(&self) -> TypeIndex {
        *self.builtin_types.get(&Type::Bool).unwrap()
    }

    /// Get the builtin `int` type.
    pub fn get_int_ty(&self) -> TypeIndex {
        *self.builtin_types.get(&Type::Int).unwrap()
    }

    /// Get the builtin `float` type.
    pub fn get_float_ty(&self) -> TypeIndex {
        *self.builtin_types.get(&Type::Float).unwrap()
    }

    /// Get the builtin `string` type.
    pub fn get_string_ty(&self) -> TypeIndex {
        *self.builtin_types.get(&Type::String).unwrap()
    }

    /// The sole constructor of the universal base class.
    pub fn any_constructor(&self) -> DeclIndex {
        let class = self.expect_class(self.any_class);
        *class
            .members
            .iter()
            .find(|idx| {
                matches!(
                    &self.get_decl(**idx).kind,
                    DeclKind::Function(f) if f.kind == FunctionKind::Constructor
                )
            })
            .expect("universal base class has a constructor")
    }

    pub fn expect_class(&self, idx: DeclIndex) -> &ClassBody {
        match &self.get_decl(idx).kind {
            DeclKind::Class(body) => body,
            other => panic!("expected class declaration, found {}", other.kind_name()),
        }
    }

    pub fn expect_function(&self, idx: DeclIndex) -> &FunctionBody {
        match &self.get_decl(idx).kind {
            DeclKind::Function(body) => body,
            other => panic!("expected function declaration, found {}", other.kind_name()),
        }
    }

    pub fn expect_script(&self, idx: DeclIndex) -> &ScriptBody {
        match &self.get_decl(idx).kind {
            DeclKind::Script(body) => body,
            other => panic!("expected script declaration, found {}", other.kind_name()),
        }
    }

    /// Finds a member function of `class` by name.
    pub fn find_member_function(&self, class: DeclIndex, name: &str) -> Option<DeclIndex> {
        self.expect_class(class).members.iter().copied().find(|idx| {
            let decl = self.get_decl(*idx);
            matches!(decl.kind, DeclKind::Function(_)) && decl.name == name
        })
    }

    /// Finds a member field of `class` by name, looking through properties
    /// into their backing fields.
    pub fn find_member_field(&self, class: DeclIndex, name: &str) -> Option<DeclIndex> {
        self.expect_class(class).members.iter().find_map(|idx| {
            let decl = self.get_decl(*idx);
            match &decl.kind {
                DeclKind::Field(_) if decl.name == name => Some(*idx),
                DeclKind::Property(p) if decl.name == name => p.backing_field,
                _ => None,
            }
        })
    }
}

/// A module: the IR of one source file.
#[derive(Debug, Clone)]
pub struct ModuleBody {
    pub name: String,
    pub package: String,
    /// Top-level declarations, in source order.
    pub declarations: Vec<DeclIndex>,
    pub annotations: Vec<Annotation>,
    pub metadata: Option<UnitMetadata>,
    pub span: Span,
    /// The file where this module resides.
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub span: Span,
}

/// Opaque serialized-metadata payload recorded by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMetadata {
    pub name: String,
}

/// A declaration node.
///
/// `parent` is the structural container. Every non-root declaration's parent
/// must, once a rewrite finishes, point at a node that actually contains it;
/// the deep-copy engine violates this transiently and re-establishes it when
/// re-parenting completes.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub span: Span,
    pub parent: Option<DeclIndex>,
    pub origin: DeclOrigin,
    /// The declared type: a classifier type for classes and scripts, the
    /// value type for everything else.
    pub ty: TypeIndex,
    pub kind: DeclKind,
}

/// Why a declaration exists. Synthetic origins let later passes recognize
/// nodes they must not process twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclOrigin {
    Defined,
    ScriptClass,
    InstanceReceiver,
    ScriptCallParameter,
    ScriptImplicitReceiver,
    ScriptResultProperty,
    ScriptProvidedProperty,
    FieldForScriptParameter,
    StmPlugin,
}

#[derive(Debug, Clone)]
pub enum DeclKind {
    Class(ClassBody),
    Function(FunctionBody),
    Property(PropertyBody),
    Field(FieldBody),
    ValueParameter(ParamBody),
    Script(ScriptBody),
}

impl DeclKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DeclKind::Class(_) => "class",
            DeclKind::Function(_) => "function",
            DeclKind::Property(_) => "property",
            DeclKind::Field(_) => "field",
            DeclKind::ValueParameter(_) => "value parameter",
            DeclKind::Script(_) => "script",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
}

#[derive(Debug, Clone)]
pub struct ClassBody {
    pub kind: ClassKind,
    pub superclass: Option<TypeIndex>,
    pub this_receiver: Option<DeclIndex>,
    /// Member declarations, in source order.
    pub members: Vec<DeclIndex>,
    pub annotations: Vec<Annotation>,
    pub metadata: Option<UnitMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Method,
    Constructor,
    Getter,
    Setter,
    Closure,
}

#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub kind: FunctionKind,
    pub dispatch_receiver: Option<DeclIndex>,
    pub params: Vec<DeclIndex>,
    pub ret_ty: TypeIndex,
    pub is_override: bool,
    pub body: Option<Vec<Statement>>,
}

#[derive(Debug, Clone)]
pub struct PropertyBody {
    pub mutable: bool,
    pub backing_field: Option<DeclIndex>,
    pub getter: Option<DeclIndex>,
    pub setter: Option<DeclIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone)]
pub struct FieldBody {
    pub visibility: Visibility,
    pub is_final: bool,
    pub initializer: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct ParamBody {
    pub default_value: Option<Expr>,
}

/// A script unit: top-level statements grouped as if they were a class.
///
/// Transitional shape. Created once by the declaration generator, consumed
/// and destroyed exactly once by the script-to-class lowering, which replaces
/// it in its container's declaration list with a genuine class.
#[derive(Debug, Clone)]
pub struct ScriptBody {
    pub this_receiver: DeclIndex,
    pub base_class: TypeIndex,
    pub implicit_receivers: Vec<DeclIndex>,
    pub explicit_call_parameters: Vec<DeclIndex>,
    /// Member declarations; includes provided properties and the result
    /// property, if any.
    pub members: Vec<DeclIndex>,
    /// Top-level executable statements, in source order.
    pub statements: Vec<Statement>,
    pub result_property: Option<DeclIndex>,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub span: Option<Span>,
    pub kind: StatementKind,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    Expr(Expr),
    Return(Expr),
    /// Delegation to a superclass constructor, valid only inside constructors.
    DelegatingConstructorCall { ctor: DeclIndex, args: Vec<Expr> },
    /// Marker running the instance initializers of `class`.
    InstanceInitializer { class: DeclIndex },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Const(ConstValue),
    /// A typed null literal.
    Null(TypeIndex),
    /// Read of a value declaration (parameter or receiver).
    GetValue { value: DeclIndex },
    GetField {
        receiver: Box<Expr>,
        field: DeclIndex,
    },
    SetField {
        receiver: Box<Expr>,
        field: DeclIndex,
        value: Box<Expr>,
    },
    /// Access to a singleton object instance.
    GetObject { class: DeclIndex },
    Call {
        callee: DeclIndex,
        receiver: Option<Box<Expr>>,
        args: Vec<Expr>,
        /// The call's result type.
        ty: TypeIndex,
    },
    /// A function expression wrapping a locally declared closure function.
    Closure { function: DeclIndex, ty: TypeIndex },
}

/// Computes the static type of an expression.
pub fn expr_type(unit: &IrUnit, expr: &Expr) -> TypeIndex {
    match expr {
        Expr::Const(value) => match value {
            ConstValue::Unit => unit.get_unit_ty(),
            ConstValue::Bool(_) => unit.get_bool_ty(),
            ConstValue::Int(_) => unit.get_int_ty(),
            ConstValue::Float(_) => unit.get_float_ty(),
            ConstValue::Str(_) => unit.get_string_ty(),
        },
        Expr::Null(ty) => *ty,
        Expr::GetValue { value } => unit.get_decl(*value).ty,
        Expr::GetField { field, .. } => unit.get_decl(*field).ty,
        Expr::SetField { .. } => unit.get_unit_ty(),
        Expr::GetObject { class } => unit.get_decl(*class).ty,
        Expr::Call { ty, .. } => *ty,
        Expr::Closure { ty, .. } => *ty,
    }
}

/// An IR type, cheaply clonable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Bool,
    Int,
    Float,
    String,
    Nullable(TypeIndex),
    /// A class or script classifier.
    Class(DeclIndex),
    Function {
        params: Vec<TypeIndex>,
        ret: TypeIndex,
    },
}

impl Type {
    pub fn display(&self, unit: &IrUnit) -> String {
        match self {
            Type::Unit => "()".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Int => "int".to_string(),
            Type::Float => "float".to_string(),
            Type::String => "string".to_string(),
            Type::Nullable(inner) => {
                format!("{}?", unit.get_type(*inner).display(unit))
            }
            Type::Class(idx) => unit.get_decl(*idx).name.clone(),
            Type::Function { params, ret } => format!(
                "({}) -> {}",
                params
                    .iter()
                    .map(|p| unit.get_type(*p).display(unit))
                    .join(", "),
                unit.get_type(*ret).display(unit)
            ),
        }
    }

    /// The classifier declaration this type references, if any.
    pub fn classifier(&self) -> Option<DeclIndex> {
        match self {
            Type::Class(idx) => Some(*idx),
            _ => None,
        }
    }
}
