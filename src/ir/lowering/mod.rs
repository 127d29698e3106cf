use std::collections::HashMap;

use crate::ir::{
    DeclIndex, IrUnit, ModuleIndex, QualifiedName, Type, TypeIndex,
};
use crate::sem::SemType;

mod copy;
mod errors;
mod lower;
mod remap;
mod scripts;

pub use copy::{copy_decl, copy_statement};
pub use errors::LoweringError;
pub use lower::{check_no_scripts_remain, lower_module, lower_unit};
pub use remap::{remap_type, SymbolRemapper};
pub use scripts::generate_script;

/// Name lookup tables, scoped to one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Classes visible to this unit, including dependency classes, by
    /// package-qualified name.
    pub classes: HashMap<QualifiedName, DeclIndex>,
    /// Value declarations currently in scope during generation.
    pub values: HashMap<String, DeclIndex>,
    /// Script units generated so far, in generation order.
    pub scripts: Vec<DeclIndex>,
}

/// Context to help build and rewrite the IR.
///
/// Owns the unit's arenas and lookup tables; threaded by `&mut` through every
/// transformation call. Lives exactly as long as one compilation unit.
#[derive(Debug, Clone)]
pub struct IrBuilder {
    pub ir: IrUnit,
    pub symbols: SymbolTable,
    pub local_module: Option<ModuleIndex>,
    /// Classifier types already created for declarations, to not duplicate
    /// `TypeIndex` values per class.
    pub class_types: HashMap<DeclIndex, TypeIndex>,
    /// Memoized front-end types, keyed structurally (spans ignored).
    pub sem_type_cache: HashMap<SemType, TypeIndex>,
}

impl IrBuilder {
    pub fn get_current_module_idx(&self) -> ModuleIndex {
        self.local_module.expect("no module is being lowered")
    }

    /// Inserts a type into the unit's type arena.
    pub fn add_type(&mut self, ty: Type) -> TypeIndex {
        if let Some(idx) = self.ir.builtin_types.get(&ty) {
            return *idx;
        }
        self.ir.types.insert(Some(ty))
    }

    /// The classifier type of a class or script declaration.
    pub fn class_type(&mut self, decl: DeclIndex) -> TypeIndex {
        if let Some(idx) = self.class_types.get(&decl) {
            return *idx;
        }
        let idx = self.ir.types.insert(Some(Type::Class(decl)));
        self.class_types.insert(decl, idx);
        idx
    }

    /// Lowers a resolved front-end type to an IR type.
    pub fn lower_sem_type(&mut self, ty: &SemType) -> Result<TypeIndex, LoweringError> {
        if let Some(idx) = self.sem_type_cache.get(ty) {
            return Ok(*idx);
        }

        let idx = match ty {
            SemType::Unit => self.ir.get_unit_ty(),
            SemType::Bool => self.ir.get_bool_ty(),
            SemType::Int => self.ir.get_int_ty(),
            SemType::Float => self.ir.get_float_ty(),
            SemType::String => self.ir.get_string_ty(),
            SemType::Class { name, span } => {
                let class = *self.symbols.classes.get(name).ok_or_else(|| {
                    LoweringError::UnrecognizedType {
                        span: *span,
                        name: name.to_string(),
                        path: self.current_file_path(),
                    }
                })?;
                self.class_type(class)
            }
            SemType::Nullable(inner) => {
                let inner = self.lower_sem_type(inner)?;
                self.add_type(Type::Nullable(inner))
            }
        };

        self.sem_type_cache.insert(ty.clone(), idx);
        Ok(idx)
    }

    pub(crate) fn current_file_path(&self) -> std::path::PathBuf {
        self.local_module
            .map(|idx| self.ir.modules[idx].file_path.clone())
            .unwrap_or_default()
    }
}
