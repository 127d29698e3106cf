use tracing::trace;

use crate::ir::{
    lowering::{remap_type, IrBuilder, LoweringError, SymbolRemapper},
    ClassBody, DeclIndex, DeclKind, Declaration, Expr, FieldBody, FunctionBody, ParamBody,
    PropertyBody, Statement, StatementKind,
};

/// Structurally clones the declaration subtree rooted at `idx` into the slots
/// the remapper reserved, rewriting every embedded declaration and type
/// reference, and re-parenting each copy under its new structural container.
///
/// Node ordering within member lists and statement sequences is preserved.
/// Any node whose required substructure is absent is a fatal
/// internal-consistency failure; there is no partial recovery.
pub fn copy_decl(
    builder: &mut IrBuilder,
    remapper: &SymbolRemapper,
    idx: DeclIndex,
    new_parent: Option<DeclIndex>,
) -> Result<DeclIndex, LoweringError> {
    let new_idx = remapper.remap(idx);
    if new_idx == idx {
        return Err(LoweringError::Internal(format!(
            "declaration {:?} was not marked before deep copy",
            builder.ir.get_decl(idx).name
        )));
    }
    match builder.ir.decls.get(new_idx) {
        Some(None) => {}
        Some(Some(_)) => {
            return Err(LoweringError::Internal(format!(
                "copy target slot for {:?} is already filled",
                builder.ir.get_decl(idx).name
            )));
        }
        None => {
            return Err(LoweringError::Internal(
                "copy target slot is gone from the arena".to_string(),
            ));
        }
    }

    let old = builder.ir.get_decl(idx).clone();
    trace!("copying {} {:?}", old.kind.kind_name(), old.name);

    let kind = match old.kind {
        DeclKind::Class(body) => {
            let this_receiver = body
                .this_receiver
                .map(|r| copy_decl(builder, remapper, r, Some(new_idx)))
                .transpose()?;
            let mut members = Vec::with_capacity(body.members.len());
            for member in body.members {
                members.push(copy_decl(builder, remapper, member, Some(new_idx))?);
            }
            let superclass = body
                .superclass
                .map(|s| remap_type(builder, remapper, s));
            DeclKind::Class(ClassBody {
                kind: body.kind,
                superclass,
                this_receiver,
                members,
                annotations: body.annotations,
                metadata: body.metadata,
            })
        }
        DeclKind::Function(body) => {
            let dispatch_receiver = body
                .dispatch_receiver
                .map(|r| copy_decl(builder, remapper, r, Some(new_idx)))
                .transpose()?;
            let mut params = Vec::with_capacity(body.params.len());
            for param in body.params {
                params.push(copy_decl(builder, remapper, param, Some(new_idx))?);
            }
            let ret_ty = remap_type(builder, remapper, body.ret_ty);
            let body_stmts = body
                .body
                .map(|stmts| {
                    stmts
                        .into_iter()
                        .map(|stmt| copy_statement(builder, remapper, &stmt, new_idx))
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()?;
            DeclKind::Function(FunctionBody {
                kind: body.kind,
                dispatch_receiver,
                params,
                ret_ty,
                is_override: body.is_override,
                body: body_stmts,
            })
        }
        DeclKind::Property(body) => {
            let backing_field = body
                .backing_field
                .map(|f| copy_decl(builder, remapper, f, Some(new_idx)))
                .transpose()?;
            let getter = body
                .getter
                .map(|g| copy_decl(builder, remapper, g, Some(new_idx)))
                .transpose()?;
            let setter = body
                .setter
                .map(|s| copy_decl(builder, remapper, s, Some(new_idx)))
                .transpose()?;
            DeclKind::Property(PropertyBody {
                mutable: body.mutable,
                backing_field,
                getter,
                setter,
            })
        }
        DeclKind::Field(body) => {
            let initializer = body
                .initializer
                .map(|init| copy_expr(builder, remapper, &init, new_idx))
                .transpose()?;
            DeclKind::Field(FieldBody {
                visibility: body.visibility,
                is_final: body.is_final,
                initializer,
            })
        }
        DeclKind::ValueParameter(body) => {
            let default_value = body
                .default_value
                .map(|d| copy_expr(builder, remapper, &d, new_idx))
                .transpose()?;
            DeclKind::ValueParameter(ParamBody { default_value })
        }
        DeclKind::Script(_) => {
            return Err(LoweringError::Internal(format!(
                "script {:?} cannot be deep-copied; scripts lower to classes",
                old.name
            )));
        }
    };

    let ty = remap_type(builder, remapper, old.ty);
    builder.ir.decls[new_idx] = Some(Declaration {
        name: old.name,
        span: old.span,
        parent: new_parent,
        origin: old.origin,
        ty,
        kind,
    });
    Ok(new_idx)
}

/// Clones a statement, translating references through the remapper. Closures
/// owned by the statement are deep-copied under `owner`.
pub fn copy_statement(
    builder: &mut IrBuilder,
    remapper: &SymbolRemapper,
    stmt: &Statement,
    owner: DeclIndex,
) -> Result<Statement, LoweringError> {
    let kind = match &stmt.kind {
        StatementKind::Expr(expr) => {
            StatementKind::Expr(copy_expr(builder, remapper, expr, owner)?)
        }
        StatementKind::Return(expr) => {
            StatementKind::Return(copy_expr(builder, remapper, expr, owner)?)
        }
        StatementKind::DelegatingConstructorCall { ctor, args } => {
            let args = args
                .iter()
                .map(|arg| copy_expr(builder, remapper, arg, owner))
                .collect::<Result<Vec<_>, _>>()?;
            StatementKind::DelegatingConstructorCall {
                ctor: remapper.remap(*ctor),
                args,
            }
        }
        StatementKind::InstanceInitializer { class } => StatementKind::InstanceInitializer {
            class: remapper.remap(*class),
        },
    };
    Ok(Statement {
        span: stmt.span,
        kind,
    })
}

pub(crate) fn copy_expr(
    builder: &mut IrBuilder,
    remapper: &SymbolRemapper,
    expr: &Expr,
    owner: DeclIndex,
) -> Result<Expr, LoweringError> {
    Ok(match expr {
        Expr::Const(value) => Expr::Const(value.clone()),
        Expr::Null(ty) => Expr::Null(remap_type(builder, remapper, *ty)),
        Expr::GetValue { value } => Expr::GetValue {
            value: remapper.remap(*value),
        },
        Expr::GetField { receiver, field } => Expr::GetField {
            receiver: Box::new(copy_expr(builder, remapper, receiver, owner)?),
            field: remapper.remap(*field),
        },
        Expr::SetField {
            receiver,
            field,
            value,
        } => Expr::SetField {
            receiver: Box::new(copy_expr(builder, remapper, receiver, owner)?),
            field: remapper.remap(*field),
            value: Box::new(copy_expr(builder, remapper, value, owner)?),
        },
        Expr::GetObject { class } => Expr::GetObject {
            class: remapper.remap(*class),
        },
        Expr::Call {
            callee,
            receiver,
            args,
            ty,
        } => Expr::Call {
            callee: remapper.remap(*callee),
            receiver: receiver
                .as_ref()
                .map(|r| copy_expr(builder, remapper, r, owner).map(Box::new))
                .transpose()?,
            args: args
                .iter()
                .map(|arg| copy_expr(builder, remapper, arg, owner))
                .collect::<Result<Vec<_>, _>>()?,
            ty: remap_type(builder, remapper, *ty),
        },
        Expr::Closure { function, ty } => Expr::Closure {
            function: copy_decl(builder, remapper, *function, Some(owner))?,
            ty: remap_type(builder, remapper, *ty),
        },
    })
}
