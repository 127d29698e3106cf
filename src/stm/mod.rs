//! Software-transactional-memory rewrite extension.
//!
//! Operates on already-lowered IR classes. Which classes are "shared" (and
//! which functions are atomic) is decided by an external plugin-discovery
//! mechanism; this module only performs the rewrite.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::ir::{
    lowering::{IrBuilder, LoweringError},
    DeclIndex, ModuleIndex, QualifiedName, Type, TypeIndex,
};

mod rewrite;

pub use rewrite::{
    patch_atomic_function, patch_module, patch_shared_class, rewrite_call_sites,
    ArgumentMap, FunctionTransformMap,
};

/// Package the STM runtime ships its entry points in.
pub const STM_PACKAGE: &str = "stm.runtime";
pub const STM_SEARCHER: &str = "StmSearcher";
pub const SEARCH_METHOD: &str = "search";
pub const STM_INTERFACE: &str = "Stm";
pub const WRAP_METHOD: &str = "wrap";
pub const GET_VAR_METHOD: &str = "getVar";
pub const SET_VAR_METHOD: &str = "setVar";
pub const RUN_ATOMICALLY_METHOD: &str = "runAtomically";
pub const GET_CONTEXT_METHOD: &str = "getContext";
pub const UNIVERSAL_DELEGATE: &str = "UniversalDelegate";
pub const STM_CONTEXT_CLASS: &str = "StmContext";

/// Reserved prefix of runtime-manager fields; such fields are never wrapped
/// in delegates again.
pub const STM_FIELD_PREFIX: &str = "stm$";
/// Name of the per-class runtime-manager field.
pub const STM_FIELD_NAME: &str = "stm$manager";
/// Reserved suffix marking generated delegate fields.
pub const DELEGATE_SUFFIX: &str = "$delegate";

pub fn getter_name(property: &str) -> String {
    format!("get${property}")
}

pub fn setter_name(property: &str) -> String {
    format!("set${property}")
}

pub fn is_stm_field_name(name: &str) -> bool {
    name.starts_with(STM_FIELD_PREFIX)
}

pub fn is_delegate_name(name: &str) -> bool {
    name.ends_with(DELEGATE_SUFFIX)
}

/// STM rewrite failures.
///
/// Configuration failures (missing runtime class or method) and
/// missing-context failures are fatal for the whole compilation unit; there
/// is no partial-STM mode.
#[derive(Debug, Error, Clone)]
pub enum StmError {
    #[error("couldn't find {class} runtime class in dependencies of module {module}")]
    RuntimeClassNotFound {
        class: QualifiedName,
        module: String,
    },
    #[error("couldn't find {class}.{method}(...) runtime method in dependencies of module {module}")]
    RuntimeMethodNotFound {
        class: String,
        method: String,
        module: String,
    },
    #[error("call of function {function} requires a transaction context in scope")]
    MissingContext { function: String },
    #[error(transparent)]
    Lowering(#[from] LoweringError),
}

/// The resolved STM runtime entry points.
///
/// Every lookup happens here, before any rewrite mutates the unit: either the
/// whole runtime surface resolves or nothing is touched.
#[derive(Debug, Clone)]
pub struct StmRuntime {
    pub searcher_class: DeclIndex,
    pub search_method: DeclIndex,
    pub stm_class: DeclIndex,
    pub wrap_method: DeclIndex,
    pub get_var_method: DeclIndex,
    pub set_var_method: DeclIndex,
    pub run_atomically_method: DeclIndex,
    pub get_context_method: DeclIndex,
    pub delegate_class: DeclIndex,
    pub context_class: DeclIndex,
    /// Return type of `getContext`, the type transaction contexts have.
    pub context_ty: TypeIndex,
}

impl StmRuntime {
    #[instrument(level = "debug", skip_all)]
    pub fn resolve(builder: &IrBuilder, module_idx: ModuleIndex) -> Result<Self, StmError> {
        let module = builder.ir.modules[module_idx].name.clone();

        let searcher_class = find_runtime_class(builder, &module, STM_SEARCHER)?;
        let stm_class = find_runtime_class(builder, &module, STM_INTERFACE)?;
        let delegate_class = find_runtime_class(builder, &module, UNIVERSAL_DELEGATE)?;
        let context_class = find_runtime_class(builder, &module, STM_CONTEXT_CLASS)?;

        let search_method = find_runtime_method(builder, &module, searcher_class, SEARCH_METHOD)?;
        let wrap_method = find_runtime_method(builder, &module, stm_class, WRAP_METHOD)?;
        let get_var_method = find_runtime_method(builder, &module, stm_class, GET_VAR_METHOD)?;
        let set_var_method = find_runtime_method(builder, &module, stm_class, SET_VAR_METHOD)?;
        let run_atomically_method =
            find_runtime_method(builder, &module, stm_class, RUN_ATOMICALLY_METHOD)?;
        let get_context_method =
            find_runtime_method(builder, &module, stm_class, GET_CONTEXT_METHOD)?;

        let context_ty = builder.ir.expect_function(get_context_method).ret_ty;
        debug!("resolved STM runtime entry points");

        Ok(Self {
            searcher_class,
            search_method,
            stm_class,
            wrap_method,
            get_var_method,
            set_var_method,
            run_atomically_method,
            get_context_method,
            delegate_class,
            context_class,
            context_ty,
        })
    }

    /// Whether a value of this type carries a transaction context.
    pub fn is_context_type(&self, builder: &IrBuilder, ty: TypeIndex) -> bool {
        match builder.ir.get_type(ty) {
            Type::Class(decl) => *decl == self.context_class,
            Type::Nullable(inner) => {
                matches!(builder.ir.get_type(*inner), Type::Class(decl) if *decl == self.context_class)
            }
            _ => false,
        }
    }

    /// The nullable context type used where an absent ambient context
    /// defaults to null.
    pub fn nullable_context_ty(&self, builder: &mut IrBuilder) -> TypeIndex {
        if matches!(builder.ir.get_type(self.context_ty), Type::Nullable(_)) {
            self.context_ty
        } else {
            builder.add_type(Type::Nullable(self.context_ty))
        }
    }
}

fn find_runtime_class(
    builder: &IrBuilder,
    module: &str,
    name: &str,
) -> Result<DeclIndex, StmError> {
    let qualified = QualifiedName::new(STM_PACKAGE, name);
    builder
        .symbols
        .classes
        .get(&qualified)
        .copied()
        .ok_or_else(|| StmError::RuntimeClassNotFound {
            class: qualified,
            module: module.to_string(),
        })
}

fn find_runtime_method(
    builder: &IrBuilder,
    module: &str,
    class: DeclIndex,
    name: &str,
) -> Result<DeclIndex, StmError> {
    builder
        .ir
        .find_member_function(class, name)
        .ok_or_else(|| StmError::RuntimeMethodNotFound {
            class: builder.ir.get_decl(class).name.clone(),
            method: name.to_string(),
            module: module.to_string(),
        })
}
