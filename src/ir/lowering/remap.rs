use std::collections::HashMap;

use tracing::trace;

use crate::ir::{
    lowering::IrBuilder, DeclIndex, DeclKind, Expr, Statement, StatementKind, Type, TypeIndex,
};

/// Maps declaration identities from a subtree about to be copied to the
/// identities its copies will have.
///
/// Seeding installs explicit old-to-new pairs (the script symbol maps to the
/// new class symbol). The marking pass then reserves a fresh arena slot for
/// every declaration a subtree owns, memoized, so marking is idempotent.
/// `remap` is a pure lookup: anything never marked or seeded resolves to
/// itself, which is what keeps references to declarations outside the copied
/// subtree intact.
#[derive(Debug, Default)]
pub struct SymbolRemapper {
    mapping: HashMap<DeclIndex, DeclIndex>,
}

impl SymbolRemapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an explicit old-to-new identity pair.
    pub fn seed(&mut self, old: DeclIndex, new: DeclIndex) {
        self.mapping.insert(old, new);
    }

    pub fn remap(&self, idx: DeclIndex) -> DeclIndex {
        *self.mapping.get(&idx).unwrap_or(&idx)
    }

    /// Whether `idx` belongs to the marked (or seeded) subtree.
    pub fn is_mapped(&self, idx: DeclIndex) -> bool {
        self.mapping.contains_key(&idx)
    }

    /// Walks the declaration subtree rooted at `idx`, reserving a fresh slot
    /// for every declaration it owns. Returns the reserved identity of `idx`
    /// itself. Must run before the deep-copy traversal of the same subtree.
    pub fn mark_decl(&mut self, builder: &mut IrBuilder, idx: DeclIndex) -> DeclIndex {
        if let Some(new_idx) = self.mapping.get(&idx) {
            return *new_idx;
        }
        let new_idx = builder.ir.decls.insert(None);
        trace!("marked declaration {:?} -> {:?}", idx, new_idx);
        self.mapping.insert(idx, new_idx);

        let decl = builder.ir.get_decl(idx).clone();
        match &decl.kind {
            DeclKind::Class(body) => {
                if let Some(receiver) = body.this_receiver {
                    self.mark_decl(builder, receiver);
                }
                for member in &body.members {
                    self.mark_decl(builder, *member);
                }
            }
            DeclKind::Function(body) => {
                if let Some(receiver) = body.dispatch_receiver {
                    self.mark_decl(builder, receiver);
                }
                for param in &body.params {
                    self.mark_decl(builder, *param);
                }
                for stmt in body.body.iter().flatten() {
                    self.mark_statement(builder, stmt);
                }
            }
            DeclKind::Property(body) => {
                if let Some(field) = body.backing_field {
                    self.mark_decl(builder, field);
                }
                if let Some(getter) = body.getter {
                    self.mark_decl(builder, getter);
                }
                if let Some(setter) = body.setter {
                    self.mark_decl(builder, setter);
                }
            }
            DeclKind::Field(body) => {
                if let Some(init) = &body.initializer {
                    self.mark_expr(builder, init);
                }
            }
            DeclKind::ValueParameter(body) => {
                if let Some(default) = &body.default_value {
                    self.mark_expr(builder, default);
                }
            }
            DeclKind::Script(body) => {
                self.mark_decl(builder, body.this_receiver);
                for receiver in &body.implicit_receivers {
                    self.mark_decl(builder, *receiver);
                }
                for param in &body.explicit_call_parameters {
                    self.mark_decl(builder, *param);
                }
                for member in &body.members {
                    self.mark_decl(builder, *member);
                }
                for stmt in &body.statements {
                    self.mark_statement(builder, stmt);
                }
            }
        }
        new_idx
    }

    /// Reserves slots for every declaration a statement owns (closures and
    /// their contents). Plain references are left alone; the copy step
    /// translates them through the populated mapping.
    pub fn mark_statement(&mut self, builder: &mut IrBuilder, stmt: &Statement) {
        match &stmt.kind {
            StatementKind::Expr(expr) | StatementKind::Return(expr) => {
                self.mark_expr(builder, expr)
            }
            StatementKind::DelegatingConstructorCall { args, .. } => {
                for arg in args {
                    self.mark_expr(builder, arg);
                }
            }
            StatementKind::InstanceInitializer { .. } => {}
        }
    }

    fn mark_expr(&mut self, builder: &mut IrBuilder, expr: &Expr) {
        match expr {
            Expr::Const(_) | Expr::Null(_) | Expr::GetValue { .. } | Expr::GetObject { .. } => {}
            Expr::GetField { receiver, .. } => self.mark_expr(builder, receiver),
            Expr::SetField {
                receiver, value, ..
            } => {
                self.mark_expr(builder, receiver);
                self.mark_expr(builder, value);
            }
            Expr::Call { receiver, args, .. } => {
                if let Some(receiver) = receiver {
                    self.mark_expr(builder, receiver);
                }
                for arg in args {
                    self.mark_expr(builder, arg);
                }
            }
            Expr::Closure { function, .. } => {
                self.mark_decl(builder, *function);
            }
        }
    }
}

/// Rewrites classifier references inside a type through the remapper.
///
/// Types are interned, so a type only gets a new index when something inside
/// it actually changed; untouched types keep their identity.
pub fn remap_type(
    builder: &mut IrBuilder,
    remapper: &SymbolRemapper,
    idx: TypeIndex,
) -> TypeIndex {
    let ty = builder.ir.get_type(idx).clone();
    match ty {
        Type::Unit | Type::Bool | Type::Int | Type::Float | Type::String => idx,
        Type::Nullable(inner) => {
            let new_inner = remap_type(builder, remapper, inner);
            if new_inner == inner {
                idx
            } else {
                builder.add_type(Type::Nullable(new_inner))
            }
        }
        Type::Class(decl) => {
            let new_decl = remapper.remap(decl);
            if new_decl == decl {
                idx
            } else {
                builder.class_type(new_decl)
            }
        }
        Type::Function { params, ret } => {
            let new_params: Vec<TypeIndex> = params
                .iter()
                .map(|p| remap_type(builder, remapper, *p))
                .collect();
            let new_ret = remap_type(builder, remapper, ret);
            if new_params == params && new_ret == ret {
                idx
            } else {
                builder.add_type(Type::Function {
                    params: new_params,
                    ret: new_ret,
                })
            }
        }
    }
}
