use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use crate::ir::{
    lowering::{IrBuilder, LoweringError},
    DeclIndex, DeclKind, DeclOrigin, Declaration, Expr, FunctionBody, FunctionKind, ModuleIndex,
    ParamBody, Span, Statement, StatementKind, Type, TypeIndex, Visibility,
};

use super::{
    getter_name, is_delegate_name, is_stm_field_name, setter_name, StmError, StmRuntime,
    DELEGATE_SUFFIX, STM_FIELD_NAME,
};

/// Original function -> its rebuilt, context-taking counterpart.
pub type FunctionTransformMap = HashMap<DeclIndex, DeclIndex>;
/// Old parameter -> the matching parameter of the rebuilt function.
pub type ArgumentMap = HashMap<DeclIndex, DeclIndex>;

/// Runs the whole STM extension over one module: resolves the runtime once,
/// patches every shared class, rebuilds every atomic function, then rewrites
/// call sites across the module.
pub fn patch_module(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    shared_classes: &[DeclIndex],
    atomic_functions: &[DeclIndex],
) -> Result<(), StmError> {
    let runtime = StmRuntime::resolve(builder, module_idx)?;

    for class in shared_classes {
        patch_shared_class_with(builder, *class, &runtime)?;
    }

    let mut transform_map = FunctionTransformMap::new();
    let mut argument_map = ArgumentMap::new();
    for function in atomic_functions {
        patch_atomic_function(
            builder,
            module_idx,
            *function,
            &runtime,
            &mut transform_map,
            &mut argument_map,
        )?;
    }

    rewrite_call_sites(builder, module_idx, &runtime, shared_classes, &transform_map)
}

/// Patches one shared class. Resolves the full runtime surface first: if any
/// entry point is missing this fails before touching the class at all.
pub fn patch_shared_class(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    class_idx: DeclIndex,
) -> Result<(), StmError> {
    let runtime = StmRuntime::resolve(builder, module_idx)?;
    patch_shared_class_with(builder, class_idx, &runtime)
}

/// The shared-class rewrite proper, strictly ordered:
/// 1. add the private final runtime-manager field;
/// 2. wrap every user-declared method body in a transactional closure;
/// 3. generate a delegate field plus accessors for every original field.
/// Delegate generation runs to completion before any call-site rewriting
/// reads the accessors; [`rewrite_call_sites`] only runs afterwards.
#[instrument(level = "debug", skip_all, fields(class = ?builder.ir.get_decl(class_idx).name))]
pub(crate) fn patch_shared_class_with(
    builder: &mut IrBuilder,
    class_idx: DeclIndex,
    runtime: &StmRuntime,
) -> Result<(), StmError> {
    let stm_ty = builder.class_type(runtime.stm_class);
    let initializer = Expr::Call {
        callee: runtime.search_method,
        receiver: Some(Box::new(Expr::GetObject {
            class: runtime.searcher_class,
        })),
        args: Vec::new(),
        ty: stm_ty,
    };
    let stm_field = builder.add_field(
        class_idx,
        STM_FIELD_NAME,
        stm_ty,
        Visibility::Private,
        DeclOrigin::StmPlugin,
        Some(initializer),
    );
    if let DeclKind::Field(field) = &mut builder.ir.get_decl_mut(stm_field).kind {
        field.is_final = true;
    }

    let methods: Vec<DeclIndex> = builder
        .ir
        .expect_class(class_idx)
        .members
        .iter()
        .copied()
        .filter(|idx| {
            let decl = builder.ir.get_decl(*idx);
            decl.origin != DeclOrigin::StmPlugin
                && matches!(&decl.kind, DeclKind::Function(f) if f.kind == FunctionKind::Method)
        })
        .collect();
    for method in methods {
        wrap_method_into_transaction(builder, method, stm_field, runtime)?;
    }

    let members = builder.ir.expect_class(class_idx).members.clone();
    for member in members {
        let decl = builder.ir.get_decl(member).clone();
        if is_stm_field_name(&decl.name)
            || is_delegate_name(&decl.name)
            || decl.origin == DeclOrigin::StmPlugin
        {
            continue;
        }
        let generated = match &decl.kind {
            DeclKind::Property(property) => {
                // No backing field means nothing to delegate: the property is
                // already rewritten or synthetic.
                let Some(field) = property.backing_field else {
                    continue;
                };
                add_delegate_and_accessors(
                    builder,
                    class_idx,
                    &decl.name,
                    field,
                    property.mutable,
                    stm_field,
                    runtime,
                )?
            }
            DeclKind::Field(_) => add_delegate_and_accessors(
                builder, class_idx, &decl.name, member, true, stm_field, runtime,
            )?,
            _ => continue,
        };
        let Some(accessors) = generated else {
            continue;
        };
        // The original member is replaced by its generated accessors, in
        // place; the delegate now holds the value.
        match &mut builder.ir.get_decl_mut(class_idx).kind {
            DeclKind::Class(body) => {
                let position = body
                    .members
                    .iter()
                    .position(|m| *m == member)
                    .ok_or_else(|| {
                        LoweringError::Internal(format!(
                            "member {:?} vanished from its class during rewrite",
                            decl.name
                        ))
                    })?;
                body.members.splice(position..=position, accessors);
            }
            _ => unreachable!(),
        }
    }
    Ok(())
}

/// Replaces the method body with a single call to `runAtomically`, passing
/// the ambient transaction context (or null: a top-level method entry
/// establishes a new transaction rather than requiring an existing one) and a
/// closure holding the original body verbatim.
fn wrap_method_into_transaction(
    builder: &mut IrBuilder,
    f_idx: DeclIndex,
    stm_field: DeclIndex,
    runtime: &StmRuntime,
) -> Result<(), StmError> {
    let decl = builder.ir.get_decl(f_idx).clone();
    let DeclKind::Function(func) = decl.kind else {
        return Err(LoweringError::UnexpectedDeclaration {
            name: decl.name.clone(),
            expected: "function",
            found: decl.kind.kind_name(),
        }
        .into());
    };
    let Some(receiver) = func.dispatch_receiver else {
        return Err(LoweringError::Internal(format!(
            "shared-class method {:?} has no dispatch receiver",
            decl.name
        ))
        .into());
    };
    let Some(original_body) = func.body else {
        // Nothing to wrap.
        return Ok(());
    };

    let lambda_idx = builder.ir.decls.insert(Some(Declaration {
        name: "<anonymous>".to_string(),
        span: decl.span,
        parent: Some(f_idx),
        origin: DeclOrigin::StmPlugin,
        ty: func.ret_ty,
        kind: DeclKind::Function(FunctionBody {
            kind: FunctionKind::Closure,
            dispatch_receiver: None,
            params: Vec::new(),
            ret_ty: func.ret_ty,
            is_override: false,
            // The original body moves in verbatim below; `return` statements
            // stay closure-local.
            body: None,
        }),
    }));
    builder.add_value_parameter(lambda_idx, "ctx", runtime.context_ty, DeclOrigin::StmPlugin);
    match &mut builder.ir.get_decl_mut(lambda_idx).kind {
        DeclKind::Function(lambda) => lambda.body = Some(original_body),
        _ => unreachable!(),
    }

    let lambda_ty = builder.add_type(Type::Function {
        params: vec![runtime.context_ty],
        ret: func.ret_ty,
    });
    let nullable_ctx = runtime.nullable_context_ty(builder);
    let ctx_expr = find_ambient_context(builder, runtime, f_idx)
        .map(|value| Expr::GetValue { value })
        .unwrap_or(Expr::Null(nullable_ctx));

    let call = Expr::Call {
        callee: runtime.run_atomically_method,
        receiver: Some(Box::new(Expr::GetField {
            receiver: Box::new(Expr::GetValue { value: receiver }),
            field: stm_field,
        })),
        args: vec![
            ctx_expr,
            Expr::Closure {
                function: lambda_idx,
                ty: lambda_ty,
            },
        ],
        ty: func.ret_ty,
    };
    match &mut builder.ir.get_decl_mut(f_idx).kind {
        DeclKind::Function(f) => {
            f.body = Some(vec![Statement {
                span: None,
                kind: StatementKind::Return(call),
            }]);
        }
        _ => unreachable!(),
    }
    debug!("wrapped method {:?} into a transaction", decl.name);
    Ok(())
}

/// Generates the delegate field plus getter (and setter, for mutable state)
/// routing through the runtime manager. Returns the accessor declarations
/// that take the original member's place, or `None` when the field must be
/// left alone.
fn add_delegate_and_accessors(
    builder: &mut IrBuilder,
    class_idx: DeclIndex,
    property_name: &str,
    backing_field: DeclIndex,
    mutable: bool,
    stm_field: DeclIndex,
    runtime: &StmRuntime,
) -> Result<Option<Vec<DeclIndex>>, StmError> {
    // A generated getter already present means this field was rewritten.
    if builder
        .ir
        .find_member_function(class_idx, &getter_name(property_name))
        .is_some()
    {
        return Ok(None);
    }

    let this_receiver = builder
        .ir
        .expect_class(class_idx)
        .this_receiver
        .ok_or_else(|| {
            LoweringError::Internal(format!(
                "shared class {:?} has no instance receiver",
                builder.ir.get_decl(class_idx).name
            ))
        })?;
    let field_decl = builder.ir.get_decl(backing_field).clone();
    let DeclKind::Field(field_body) = &field_decl.kind else {
        return Err(LoweringError::UnexpectedDeclaration {
            name: field_decl.name.clone(),
            expected: "field",
            found: field_decl.kind.kind_name(),
        }
        .into());
    };
    let field_ty = field_decl.ty;
    let delegate_ty = builder.class_type(runtime.delegate_class);

    let initial_value = field_body
        .initializer
        .clone()
        .unwrap_or(Expr::Null(field_ty));
    let wrap_call = Expr::Call {
        callee: runtime.wrap_method,
        receiver: Some(Box::new(Expr::GetField {
            receiver: Box::new(Expr::GetValue {
                value: this_receiver,
            }),
            field: stm_field,
        })),
        args: vec![initial_value],
        ty: delegate_ty,
    };
    let delegate_field = builder.add_field(
        class_idx,
        &format!("{property_name}{DELEGATE_SUFFIX}"),
        delegate_ty,
        Visibility::Private,
        DeclOrigin::StmPlugin,
        Some(wrap_call),
    );
    if let DeclKind::Field(field) = &mut builder.ir.get_decl_mut(delegate_field).kind {
        field.is_final = true;
    }

    let nullable_ctx = runtime.nullable_context_ty(builder);

    let getter = build_accessor(
        builder,
        class_idx,
        &getter_name(property_name),
        field_ty,
        field_decl.span,
    );
    let getter_ctx = builder.add_value_parameter(getter, "ctx", nullable_ctx, DeclOrigin::StmPlugin);
    let getter_this = builder
        .ir
        .expect_function(getter)
        .dispatch_receiver
        .expect("generated accessor has a dispatch receiver");
    let getter_body = vec![Statement {
        span: None,
        kind: StatementKind::Return(Expr::Call {
            callee: runtime.get_var_method,
            receiver: Some(Box::new(Expr::GetField {
                receiver: Box::new(Expr::GetValue { value: getter_this }),
                field: stm_field,
            })),
            args: vec![
                Expr::GetValue { value: getter_ctx },
                Expr::GetField {
                    receiver: Box::new(Expr::GetValue { value: getter_this }),
                    field: delegate_field,
                },
            ],
            ty: field_ty,
        }),
    }];
    match &mut builder.ir.get_decl_mut(getter).kind {
        DeclKind::Function(f) => f.body = Some(getter_body),
        _ => unreachable!(),
    }

    let mut accessors = vec![getter];
    if mutable {
        let unit_ty = builder.ir.get_unit_ty();
        let setter = build_accessor(
            builder,
            class_idx,
            &setter_name(property_name),
            unit_ty,
            field_decl.span,
        );
        let setter_ctx =
            builder.add_value_parameter(setter, "ctx", nullable_ctx, DeclOrigin::StmPlugin);
        let setter_value =
            builder.add_value_parameter(setter, "value", field_ty, DeclOrigin::StmPlugin);
        let setter_this = builder
            .ir
            .expect_function(setter)
            .dispatch_receiver
            .expect("generated accessor has a dispatch receiver");
        let setter_body = vec![Statement {
            span: None,
            kind: StatementKind::Expr(Expr::Call {
                callee: runtime.set_var_method,
                receiver: Some(Box::new(Expr::GetField {
                    receiver: Box::new(Expr::GetValue { value: setter_this }),
                    field: stm_field,
                })),
                args: vec![
                    Expr::GetValue { value: setter_ctx },
                    Expr::GetField {
                        receiver: Box::new(Expr::GetValue { value: setter_this }),
                        field: delegate_field,
                    },
                    Expr::GetValue {
                        value: setter_value,
                    },
                ],
                ty: unit_ty,
            }),
        }];
        match &mut builder.ir.get_decl_mut(setter).kind {
            DeclKind::Function(f) => f.body = Some(setter_body),
            _ => unreachable!(),
        }
        accessors.push(setter);
    }

    debug!("generated delegate and accessors for {:?}", property_name);
    Ok(Some(accessors))
}

/// A detached accessor function carrying a copy of the class receiver; the
/// caller splices it into the member list.
fn build_accessor(
    builder: &mut IrBuilder,
    class_idx: DeclIndex,
    name: &str,
    ret_ty: TypeIndex,
    span: Span,
) -> DeclIndex {
    let idx = builder.ir.decls.insert(Some(Declaration {
        name: name.to_string(),
        span,
        parent: Some(class_idx),
        origin: DeclOrigin::StmPlugin,
        ty: ret_ty,
        kind: DeclKind::Function(FunctionBody {
            kind: FunctionKind::Method,
            dispatch_receiver: None,
            params: Vec::new(),
            ret_ty,
            is_override: false,
            body: None,
        }),
    }));
    let receiver = builder
        .ir
        .expect_class(class_idx)
        .this_receiver
        .map(|r| builder.copy_param_to(r, idx));
    match &mut builder.ir.get_decl_mut(idx).kind {
        DeclKind::Function(f) => f.dispatch_receiver = receiver,
        _ => unreachable!(),
    }
    idx
}

/// Rebuilds a function with a trailing transaction-context parameter. The
/// body is copied with value reads redirected from the old parameters to the
/// new ones; the old function is replaced in its container and recorded in
/// the transform map so call sites can be redirected.
#[instrument(level = "debug", skip_all, fields(name = ?builder.ir.get_decl(f_idx).name))]
pub fn patch_atomic_function(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    f_idx: DeclIndex,
    runtime: &StmRuntime,
    transform_map: &mut FunctionTransformMap,
    argument_map: &mut ArgumentMap,
) -> Result<DeclIndex, StmError> {
    let old = builder.ir.get_decl(f_idx).clone();
    let DeclKind::Function(func) = old.kind else {
        return Err(LoweringError::UnexpectedDeclaration {
            name: old.name.clone(),
            expected: "function",
            found: old.kind.kind_name(),
        }
        .into());
    };

    let new_idx = builder.ir.decls.insert(None);
    let dispatch_receiver = func.dispatch_receiver.map(|r| {
        let copy = builder.copy_param_to(r, new_idx);
        argument_map.insert(r, copy);
        copy
    });
    let mut params = Vec::with_capacity(func.params.len() + 1);
    for param in &func.params {
        let copy = builder.copy_param_to(*param, new_idx);
        argument_map.insert(*param, copy);
        params.push(copy);
    }
    let ctx_param = builder.ir.decls.insert(Some(Declaration {
        name: "ctx".to_string(),
        span: old.span,
        parent: Some(new_idx),
        origin: DeclOrigin::StmPlugin,
        ty: runtime.context_ty,
        kind: DeclKind::ValueParameter(ParamBody {
            default_value: None,
        }),
    }));
    params.push(ctx_param);

    let body = func.body.as_ref().map(|stmts| {
        stmts
            .iter()
            .map(|stmt| patch_statement_values(stmt, argument_map))
            .collect()
    });
    builder.ir.decls[new_idx] = Some(Declaration {
        name: old.name.clone(),
        span: old.span,
        parent: old.parent,
        origin: DeclOrigin::StmPlugin,
        ty: old.ty,
        kind: DeclKind::Function(FunctionBody {
            kind: func.kind,
            dispatch_receiver,
            params,
            ret_ty: func.ret_ty,
            is_override: func.is_override,
            body,
        }),
    });

    replace_in_container(builder, module_idx, f_idx, new_idx)?;
    transform_map.insert(f_idx, new_idx);
    Ok(new_idx)
}

/// Redirects value reads through the argument map.
fn patch_statement_values(stmt: &Statement, map: &ArgumentMap) -> Statement {
    let kind = match &stmt.kind {
        StatementKind::Expr(expr) => StatementKind::Expr(patch_expr_values(expr, map)),
        StatementKind::Return(expr) => StatementKind::Return(patch_expr_values(expr, map)),
        StatementKind::DelegatingConstructorCall { ctor, args } => {
            StatementKind::DelegatingConstructorCall {
                ctor: *ctor,
                args: args.iter().map(|arg| patch_expr_values(arg, map)).collect(),
            }
        }
        StatementKind::InstanceInitializer { class } => {
            StatementKind::InstanceInitializer { class: *class }
        }
    };
    Statement {
        span: stmt.span,
        kind,
    }
}

fn patch_expr_values(expr: &Expr, map: &ArgumentMap) -> Expr {
    match expr {
        Expr::GetValue { value } => Expr::GetValue {
            value: *map.get(value).unwrap_or(value),
        },
        Expr::GetField { receiver, field } => Expr::GetField {
            receiver: Box::new(patch_expr_values(receiver, map)),
            field: *field,
        },
        Expr::SetField {
            receiver,
            field,
            value,
        } => Expr::SetField {
            receiver: Box::new(patch_expr_values(receiver, map)),
            field: *field,
            value: Box::new(patch_expr_values(value, map)),
        },
        Expr::Call {
            callee,
            receiver,
            args,
            ty,
        } => Expr::Call {
            callee: *callee,
            receiver: receiver
                .as_ref()
                .map(|r| Box::new(patch_expr_values(r, map))),
            args: args.iter().map(|arg| patch_expr_values(arg, map)).collect(),
            ty: *ty,
        },
        Expr::Const(_) | Expr::Null(_) | Expr::GetObject { .. } | Expr::Closure { .. } => {
            expr.clone()
        }
    }
}

fn replace_in_container(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    old: DeclIndex,
    new: DeclIndex,
) -> Result<(), StmError> {
    let parent = builder.ir.get_decl(new).parent;
    if let Some(class) = parent {
        if let DeclKind::Class(body) = &mut builder.ir.get_decl_mut(class).kind {
            if let Some(slot) = body.members.iter_mut().find(|m| **m == old) {
                *slot = new;
                return Ok(());
            }
        }
    }
    let module = &mut builder.ir.modules[module_idx];
    if let Some(slot) = module.declarations.iter_mut().find(|d| **d == old) {
        *slot = new;
        return Ok(());
    }
    Err(LoweringError::Internal(format!(
        "function {:?} not found in its container",
        builder.ir.get_decl(new).name
    ))
    .into())
}

/// Rewrites call sites across the module: field accesses on shared classes
/// are redirected to the generated accessors, and calls to transformed
/// functions get the transaction context appended.
///
/// The ambient context is threaded explicitly: entering a function recomputes
/// it from the function's own receiver and trailing parameter, so the nearest
/// enclosing scope wins. Accessor calls default a missing context to null;
/// transformed-function calls require one and fail otherwise.
#[instrument(level = "debug", skip_all)]
pub fn rewrite_call_sites(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    runtime: &StmRuntime,
    shared_classes: &[DeclIndex],
    transform_map: &FunctionTransformMap,
) -> Result<(), StmError> {
    let nullable_ctx = runtime.nullable_context_ty(builder);
    let mut rewriter = CallSiteRewriter {
        builder,
        runtime,
        shared: shared_classes.iter().copied().collect(),
        transform_map,
        nullable_ctx,
    };
    let declarations = rewriter.builder.ir.modules[module_idx].declarations.clone();
    for decl_idx in declarations {
        rewriter.rewrite_decl(decl_idx, None)?;
    }
    Ok(())
}

struct CallSiteRewriter<'b> {
    builder: &'b mut IrBuilder,
    runtime: &'b StmRuntime,
    shared: HashSet<DeclIndex>,
    transform_map: &'b FunctionTransformMap,
    nullable_ctx: TypeIndex,
}

impl CallSiteRewriter<'_> {
    fn rewrite_decl(
        &mut self,
        idx: DeclIndex,
        ctx: Option<DeclIndex>,
    ) -> Result<(), StmError> {
        enum Work {
            Children(Vec<DeclIndex>),
            Function,
            Field,
            Skip,
        }
        let work = match &self.builder.ir.get_decl(idx).kind {
            DeclKind::Class(body) => Work::Children(body.members.clone()),
            DeclKind::Function(_) => Work::Function,
            DeclKind::Property(body) => Work::Children(
                [body.backing_field, body.getter, body.setter]
                    .into_iter()
                    .flatten()
                    .collect(),
            ),
            DeclKind::Field(_) => Work::Field,
            DeclKind::ValueParameter(_) | DeclKind::Script(_) => Work::Skip,
        };
        match work {
            Work::Children(children) => {
                for child in children {
                    self.rewrite_decl(child, ctx)?;
                }
                Ok(())
            }
            Work::Function => self.rewrite_function(idx, ctx),
            Work::Field => self.rewrite_field(idx, ctx),
            Work::Skip => Ok(()),
        }
    }

    fn rewrite_function(
        &mut self,
        f_idx: DeclIndex,
        outer_ctx: Option<DeclIndex>,
    ) -> Result<(), StmError> {
        let own_ctx = function_context(self.builder, self.runtime, f_idx).or(outer_ctx);
        let body = match &mut self.builder.ir.get_decl_mut(f_idx).kind {
            DeclKind::Function(f) => f.body.take(),
            _ => unreachable!(),
        };
        let body = body
            .map(|stmts| {
                stmts
                    .into_iter()
                    .map(|stmt| self.rewrite_statement(stmt, own_ctx))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        match &mut self.builder.ir.get_decl_mut(f_idx).kind {
            DeclKind::Function(f) => f.body = body,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn rewrite_field(
        &mut self,
        field_idx: DeclIndex,
        ctx: Option<DeclIndex>,
    ) -> Result<(), StmError> {
        let initializer = match &mut self.builder.ir.get_decl_mut(field_idx).kind {
            DeclKind::Field(f) => f.initializer.take(),
            _ => unreachable!(),
        };
        let initializer = initializer
            .map(|init| self.rewrite_expr(init, ctx))
            .transpose()?;
        match &mut self.builder.ir.get_decl_mut(field_idx).kind {
            DeclKind::Field(f) => f.initializer = initializer,
            _ => unreachable!(),
        }
        Ok(())
    }

    fn rewrite_statement(
        &mut self,
        stmt: Statement,
        ctx: Option<DeclIndex>,
    ) -> Result<Statement, StmError> {
        let kind = match stmt.kind {
            StatementKind::Expr(expr) => StatementKind::Expr(self.rewrite_expr(expr, ctx)?),
            StatementKind::Return(expr) => StatementKind::Return(self.rewrite_expr(expr, ctx)?),
            StatementKind::DelegatingConstructorCall { ctor, args } => {
                StatementKind::DelegatingConstructorCall {
                    ctor,
                    args: args
                        .into_iter()
                        .map(|arg| self.rewrite_expr(arg, ctx))
                        .collect::<Result<Vec<_>, _>>()?,
                }
            }
            other @ StatementKind::InstanceInitializer { .. } => other,
        };
        Ok(Statement {
            span: stmt.span,
            kind,
        })
    }

    fn rewrite_expr(&mut self, expr: Expr, ctx: Option<DeclIndex>) -> Result<Expr, StmError> {
        Ok(match expr {
            Expr::GetField { receiver, field } => {
                let receiver = self.rewrite_expr(*receiver, ctx)?;
                let name = self.builder.ir.get_decl(field).name.clone();
                if !is_stm_field_name(&name) && !is_delegate_name(&name) {
                    if let Some(class) = self.shared_owner(field) {
                        if let Some(getter) =
                            self.builder.ir.find_member_function(class, &getter_name(&name))
                        {
                            let ty = self.builder.ir.get_decl(field).ty;
                            return Ok(Expr::Call {
                                callee: getter,
                                receiver: Some(Box::new(receiver)),
                                args: vec![self.ctx_or_null(ctx)],
                                ty,
                            });
                        }
                    }
                }
                Expr::GetField {
                    receiver: Box::new(receiver),
                    field,
                }
            }
            Expr::SetField {
                receiver,
                field,
                value,
            } => {
                let receiver = self.rewrite_expr(*receiver, ctx)?;
                let value = self.rewrite_expr(*value, ctx)?;
                let name = self.builder.ir.get_decl(field).name.clone();
                if !is_stm_field_name(&name) && !is_delegate_name(&name) {
                    if let Some(class) = self.shared_owner(field) {
                        if let Some(setter) =
                            self.builder.ir.find_member_function(class, &setter_name(&name))
                        {
                            let unit_ty = self.builder.ir.get_unit_ty();
                            return Ok(Expr::Call {
                                callee: setter,
                                receiver: Some(Box::new(receiver)),
                                args: vec![self.ctx_or_null(ctx), value],
                                ty: unit_ty,
                            });
                        }
                    }
                }
                Expr::SetField {
                    receiver: Box::new(receiver),
                    field,
                    value: Box::new(value),
                }
            }
            Expr::Call {
                callee,
                receiver,
                args,
                ty,
            } => {
                let receiver = receiver
                    .map(|r| self.rewrite_expr(*r, ctx).map(Box::new))
                    .transpose()?;
                let mut args = args
                    .into_iter()
                    .map(|arg| self.rewrite_expr(arg, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(new_callee) = self.transform_map.get(&callee) {
                    // A transformed callee requires an existing transaction.
                    let function = self.builder.ir.get_decl(callee).name.clone();
                    let ctx = ctx.ok_or(StmError::MissingContext { function })?;
                    args.push(Expr::GetValue { value: ctx });
                    return Ok(Expr::Call {
                        callee: *new_callee,
                        receiver,
                        args,
                        ty,
                    });
                }
                Expr::Call {
                    callee,
                    receiver,
                    args,
                    ty,
                }
            }
            Expr::Closure { function, ty } => {
                self.rewrite_function(function, ctx)?;
                Expr::Closure { function, ty }
            }
            other @ (Expr::Const(_) | Expr::Null(_) | Expr::GetValue { .. }
            | Expr::GetObject { .. }) => other,
        })
    }

    /// The shared class owning a field, if any, walking parent links through
    /// wrapping properties.
    fn shared_owner(&self, field: DeclIndex) -> Option<DeclIndex> {
        let mut cursor = Some(field);
        while let Some(idx) = cursor {
            let decl = self.builder.ir.get_decl(idx);
            if matches!(decl.kind, DeclKind::Class(_)) {
                return self.shared.contains(&idx).then_some(idx);
            }
            cursor = decl.parent;
        }
        None
    }

    fn ctx_or_null(&self, ctx: Option<DeclIndex>) -> Expr {
        ctx.map(|value| Expr::GetValue { value })
            .unwrap_or(Expr::Null(self.nullable_ctx))
    }
}

/// The context-typed value a function itself carries: its dispatch receiver
/// or its trailing parameter.
fn function_context(
    builder: &IrBuilder,
    runtime: &StmRuntime,
    f_idx: DeclIndex,
) -> Option<DeclIndex> {
    let func = builder.ir.expect_function(f_idx);
    if let Some(receiver) = func.dispatch_receiver {
        if runtime.is_context_type(builder, builder.ir.get_decl(receiver).ty) {
            return Some(receiver);
        }
    }
    if let Some(last) = func.params.last() {
        if runtime.is_context_type(builder, builder.ir.get_decl(*last).ty) {
            return Some(*last);
        }
    }
    None
}

/// Searches outward through the enclosing-declaration chain for the nearest
/// function carrying a transaction context.
fn find_ambient_context(
    builder: &IrBuilder,
    runtime: &StmRuntime,
    from: DeclIndex,
) -> Option<DeclIndex> {
    let mut cursor = builder.ir.get_decl(from).parent;
    while let Some(idx) = cursor {
        let decl = builder.ir.get_decl(idx);
        if matches!(decl.kind, DeclKind::Function(_)) {
            if let Some(ctx) = function_context(builder, runtime, idx) {
                return Some(ctx);
            }
        }
        cursor = decl.parent;
    }
    None
}
