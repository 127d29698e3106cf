use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::ir::{
    builders::THIS_NAME,
    lowering::{IrBuilder, LoweringError},
    DeclIndex, DeclKind, DeclOrigin, Declaration, Expr, FieldBody, FunctionBody, FunctionKind,
    ModuleIndex, ParamBody, PropertyBody, ScriptBody, Statement, StatementKind, Visibility,
    expr_type,
};
use crate::sem::{
    FunctionDescriptor, MemberDescriptor, PropertyDescriptor, ScriptDescriptor, SemExpr,
    SemStatement, Span,
};

/// Name resolution scope while generating one script (or one member body).
#[derive(Debug, Clone)]
struct ScriptScope {
    script: DeclIndex,
    script_name: String,
    /// Value declarations reachable as bare names.
    values: HashMap<String, DeclIndex>,
    /// Members of the script generated so far, reachable through `this`.
    members: HashMap<String, DeclIndex>,
}

impl ScriptScope {
    fn this_receiver(&self) -> DeclIndex {
        *self
            .values
            .get(THIS_NAME)
            .expect("script scope always binds `this`")
    }
}

/// Converts a resolved script descriptor into a script unit declaration and
/// appends it to the module's declaration list.
///
/// Receivers of previously generated sibling scripts are registered into the
/// current scope first: later scripts may reference earlier scripts' captured
/// state. This cross-script visibility is intentional.
#[instrument(level = "debug", skip_all, fields(name = ?desc.name))]
pub fn generate_script(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
    desc: &ScriptDescriptor,
) -> Result<DeclIndex, LoweringError> {
    builder.local_module = Some(module_idx);

    for script in builder.symbols.scripts.clone() {
        let receiver = builder.ir.expect_script(script).this_receiver;
        let name = builder.ir.get_decl(script).name.clone();
        debug!("introducing receiver of earlier script {:?} into scope", name);
        builder.symbols.values.insert(name, receiver);
    }

    let script_idx = builder.ir.decls.insert(None);
    let script_ty = builder.class_type(script_idx);
    let base_class = builder.class_type(builder.ir.any_class);

    let this_receiver = builder.ir.decls.insert(Some(Declaration {
        name: THIS_NAME.to_string(),
        span: desc.span,
        parent: Some(script_idx),
        origin: DeclOrigin::InstanceReceiver,
        ty: script_ty,
        kind: DeclKind::ValueParameter(ParamBody {
            default_value: None,
        }),
    }));

    let mut scope = ScriptScope {
        script: script_idx,
        script_name: desc.name.clone(),
        values: builder.symbols.values.clone(),
        members: HashMap::new(),
    };
    scope.values.insert(THIS_NAME.to_string(), this_receiver);

    let mut implicit_receivers = Vec::with_capacity(desc.implicit_receivers.len());
    for captured in &desc.implicit_receivers {
        let ty = builder.lower_sem_type(&captured.ty)?;
        let param = builder.ir.decls.insert(Some(Declaration {
            name: captured.name.clone(),
            span: captured.span,
            parent: Some(script_idx),
            origin: DeclOrigin::ScriptImplicitReceiver,
            ty,
            kind: DeclKind::ValueParameter(ParamBody {
                default_value: None,
            }),
        }));
        scope.values.insert(captured.name.clone(), param);
        implicit_receivers.push(param);
    }

    let mut explicit_call_parameters = Vec::with_capacity(desc.call_parameters.len());
    for param_desc in &desc.call_parameters {
        let ty = builder.lower_sem_type(&param_desc.ty)?;
        let default_value = param_desc
            .default_value
            .as_ref()
            .map(|expr| lower_expr(builder, &scope, expr))
            .transpose()?;
        let param = builder.ir.decls.insert(Some(Declaration {
            name: param_desc.name.clone(),
            span: param_desc.span,
            parent: Some(script_idx),
            origin: DeclOrigin::ScriptCallParameter,
            ty,
            kind: DeclKind::ValueParameter(ParamBody { default_value }),
        }));
        scope.values.insert(param_desc.name.clone(), param);
        explicit_call_parameters.push(param);
    }

    let mut members = Vec::new();
    for member in &desc.members {
        let idx = generate_member(builder, &mut scope, member)?;
        // Every member must lower to exactly one declaration; a reserved but
        // unfilled slot means an earlier step silently produced nothing.
        if builder.ir.decls.get(idx).is_none_or(|slot| slot.is_none()) {
            let (name, span) = member_name_span(member);
            return Err(LoweringError::MemberNotLowered {
                span,
                name: name.to_string(),
                script: desc.name.clone(),
                path: builder.current_file_path(),
            });
        }
        members.push(idx);
    }

    for provided in &desc.provided_properties {
        let idx = generate_property(
            builder,
            &mut scope,
            provided,
            DeclOrigin::ScriptProvidedProperty,
        )?;
        members.push(idx);
    }

    let result_property = desc
        .result_value
        .as_ref()
        .map(|result| {
            generate_property(builder, &mut scope, result, DeclOrigin::ScriptResultProperty)
        })
        .transpose()?;
    if let Some(result) = result_property {
        members.push(result);
    }

    let statements = desc
        .statements
        .iter()
        .map(|stmt| lower_statement(builder, &scope, stmt))
        .collect::<Result<Vec<_>, _>>()?;

    builder.ir.decls[script_idx] = Some(Declaration {
        name: desc.name.clone(),
        span: desc.span,
        parent: None,
        origin: DeclOrigin::Defined,
        ty: script_ty,
        kind: DeclKind::Script(ScriptBody {
            this_receiver,
            base_class,
            implicit_receivers,
            explicit_call_parameters,
            members,
            statements,
            result_property,
        }),
    });

    builder.symbols.scripts.push(script_idx);
    builder.ir.modules[module_idx].declarations.push(script_idx);
    Ok(script_idx)
}

fn member_name_span(member: &MemberDescriptor) -> (&str, Span) {
    match member {
        MemberDescriptor::Property(p) => (&p.name, p.span),
        MemberDescriptor::Function(f) => (&f.name, f.span),
    }
}

fn generate_member(
    builder: &mut IrBuilder,
    scope: &mut ScriptScope,
    member: &MemberDescriptor,
) -> Result<DeclIndex, LoweringError> {
    match member {
        MemberDescriptor::Property(p) => generate_property(builder, scope, p, DeclOrigin::Defined),
        MemberDescriptor::Function(f) => generate_function(builder, scope, f),
    }
}

fn generate_property(
    builder: &mut IrBuilder,
    scope: &mut ScriptScope,
    desc: &PropertyDescriptor,
    origin: DeclOrigin,
) -> Result<DeclIndex, LoweringError> {
    debug!("generating property {:?}", desc.name);
    let ty = builder.lower_sem_type(&desc.ty)?;
    let initializer = desc
        .initializer
        .as_ref()
        .map(|expr| lower_expr(builder, scope, expr))
        .transpose()?;

    let property_idx = builder.ir.decls.insert(None);
    let field = builder.ir.decls.insert(Some(Declaration {
        name: desc.name.clone(),
        span: desc.span,
        parent: Some(property_idx),
        origin,
        ty,
        kind: DeclKind::Field(FieldBody {
            visibility: Visibility::Private,
            is_final: !desc.mutable,
            initializer,
        }),
    }));
    builder.ir.decls[property_idx] = Some(Declaration {
        name: desc.name.clone(),
        span: desc.span,
        parent: Some(scope.script),
        origin,
        ty,
        kind: DeclKind::Property(PropertyBody {
            mutable: desc.mutable,
            backing_field: Some(field),
            getter: None,
            setter: None,
        }),
    });
    scope.members.insert(desc.name.clone(), property_idx);
    Ok(property_idx)
}

fn generate_function(
    builder: &mut IrBuilder,
    scope: &mut ScriptScope,
    desc: &FunctionDescriptor,
) -> Result<DeclIndex, LoweringError> {
    debug!("generating function {:?}", desc.name);
    let ret_ty = builder.lower_sem_type(&desc.ret_ty)?;
    let function_idx = builder.ir.decls.insert(None);

    // The enclosing script binds `this` to its own receiver; member functions
    // dispatch on a copy of it.
    let dispatch_receiver = builder.copy_param_to(scope.this_receiver(), function_idx);

    let mut body_scope = scope.clone();
    body_scope
        .values
        .insert(THIS_NAME.to_string(), dispatch_receiver);

    let mut params = Vec::with_capacity(desc.params.len());
    for param_desc in &desc.params {
        let ty = builder.lower_sem_type(&param_desc.ty)?;
        let default_value = param_desc
            .default_value
            .as_ref()
            .map(|expr| lower_expr(builder, &body_scope, expr))
            .transpose()?;
        let param = builder.ir.decls.insert(Some(Declaration {
            name: param_desc.name.clone(),
            span: param_desc.span,
            parent: Some(function_idx),
            origin: DeclOrigin::Defined,
            ty,
            kind: DeclKind::ValueParameter(ParamBody { default_value }),
        }));
        body_scope.values.insert(param_desc.name.clone(), param);
        params.push(param);
    }

    let body = desc
        .body
        .iter()
        .map(|stmt| lower_statement(builder, &body_scope, stmt))
        .collect::<Result<Vec<_>, _>>()?;

    builder.ir.decls[function_idx] = Some(Declaration {
        name: desc.name.clone(),
        span: desc.span,
        parent: Some(scope.script),
        origin: DeclOrigin::Defined,
        ty: ret_ty,
        kind: DeclKind::Function(FunctionBody {
            kind: FunctionKind::Method,
            dispatch_receiver: Some(dispatch_receiver),
            params,
            ret_ty,
            is_override: desc.is_override,
            body: Some(body),
        }),
    });
    scope.members.insert(desc.name.clone(), function_idx);
    Ok(function_idx)
}

fn lower_statement(
    builder: &mut IrBuilder,
    scope: &ScriptScope,
    stmt: &SemStatement,
) -> Result<Statement, LoweringError> {
    let (span, kind) = match stmt {
        SemStatement::Expr(expr) => (
            expr.span(),
            StatementKind::Expr(lower_expr(builder, scope, expr)?),
        ),
        SemStatement::Return(expr) => (
            expr.span(),
            StatementKind::Return(lower_expr(builder, scope, expr)?),
        ),
    };
    Ok(Statement {
        span: Some(span),
        kind,
    })
}

fn lower_expr(
    builder: &mut IrBuilder,
    scope: &ScriptScope,
    expr: &SemExpr,
) -> Result<Expr, LoweringError> {
    match expr {
        SemExpr::Literal { value, .. } => Ok(Expr::Const(value.clone())),
        SemExpr::Name { name, span } => {
            if let Some(value) = scope.values.get(name) {
                return Ok(Expr::GetValue { value: *value });
            }
            if let Some(member) = scope.members.get(name) {
                if let DeclKind::Property(p) = &builder.ir.get_decl(*member).kind {
                    let field = p.backing_field.ok_or_else(|| {
                        LoweringError::Internal(format!("property {name:?} has no backing field"))
                    })?;
                    return Ok(Expr::GetField {
                        receiver: Box::new(Expr::GetValue {
                            value: scope.this_receiver(),
                        }),
                        field,
                    });
                }
            }
            Err(unresolved(builder, scope, name, *span))
        }
        SemExpr::GetMember {
            receiver,
            name,
            span,
        } => {
            let receiver = lower_expr(builder, scope, receiver)?;
            let field = resolve_member_field(builder, scope, &receiver, name, *span)?;
            Ok(Expr::GetField {
                receiver: Box::new(receiver),
                field,
            })
        }
        SemExpr::SetMember {
            receiver,
            name,
            value,
            span,
        } => {
            let receiver = lower_expr(builder, scope, receiver)?;
            let value = lower_expr(builder, scope, value)?;
            let field = resolve_member_field(builder, scope, &receiver, name, *span)?;
            Ok(Expr::SetField {
                receiver: Box::new(receiver),
                field,
                value: Box::new(value),
            })
        }
        SemExpr::Call {
            target,
            receiver,
            args,
            span,
        } => {
            let receiver = receiver
                .as_ref()
                .map(|r| lower_expr(builder, scope, r))
                .transpose()?;
            let callee = match &receiver {
                Some(receiver_expr) => {
                    resolve_member_function(builder, scope, receiver_expr, target, *span)?
                }
                None => match scope.members.get(target) {
                    Some(idx)
                        if matches!(builder.ir.get_decl(*idx).kind, DeclKind::Function(_)) =>
                    {
                        *idx
                    }
                    _ => return Err(unresolved(builder, scope, target, *span)),
                },
            };
            let receiver = match receiver {
                Some(expr) => Some(Box::new(expr)),
                // Member calls without an explicit receiver dispatch on `this`.
                None => Some(Box::new(Expr::GetValue {
                    value: scope.this_receiver(),
                })),
            };
            let args = args
                .iter()
                .map(|arg| lower_expr(builder, scope, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let ty = builder.ir.expect_function(callee).ret_ty;
            Ok(Expr::Call {
                callee,
                receiver,
                args,
                ty,
            })
        }
    }
}

/// Resolves a member access against the static classifier of the receiver.
/// Works for lowered classes, not-yet-lowered sibling scripts, and the
/// script currently being generated (whose slot is still reserved).
fn resolve_member_field(
    builder: &IrBuilder,
    scope: &ScriptScope,
    receiver: &Expr,
    name: &str,
    span: Span,
) -> Result<DeclIndex, LoweringError> {
    let classifier = receiver_classifier(builder, receiver)
        .ok_or_else(|| unresolved(builder, scope, name, span))?;
    let field = if classifier == scope.script {
        scope.members.get(name).and_then(|idx| {
            match &builder.ir.get_decl(*idx).kind {
                DeclKind::Field(_) => Some(*idx),
                DeclKind::Property(p) => p.backing_field,
                _ => None,
            }
        })
    } else {
        match &builder.ir.get_decl(classifier).kind {
            DeclKind::Class(_) => builder.ir.find_member_field(classifier, name),
            DeclKind::Script(script) => find_field_in(builder, &script.members, name),
            _ => None,
        }
    };
    field.ok_or_else(|| unresolved(builder, scope, name, span))
}

fn resolve_member_function(
    builder: &IrBuilder,
    scope: &ScriptScope,
    receiver: &Expr,
    name: &str,
    span: Span,
) -> Result<DeclIndex, LoweringError> {
    let classifier = receiver_classifier(builder, receiver)
        .ok_or_else(|| unresolved(builder, scope, name, span))?;
    let function = if classifier == scope.script {
        scope
            .members
            .get(name)
            .copied()
            .filter(|idx| matches!(builder.ir.get_decl(*idx).kind, DeclKind::Function(_)))
    } else {
        match &builder.ir.get_decl(classifier).kind {
            DeclKind::Class(_) => builder.ir.find_member_function(classifier, name),
            DeclKind::Script(script) => script.members.iter().copied().find(|idx| {
                let decl = builder.ir.get_decl(*idx);
                matches!(decl.kind, DeclKind::Function(_)) && decl.name == name
            }),
            _ => None,
        }
    };
    function.ok_or_else(|| unresolved(builder, scope, name, span))
}

fn receiver_classifier(builder: &IrBuilder, receiver: &Expr) -> Option<DeclIndex> {
    let ty = expr_type(&builder.ir, receiver);
    builder.ir.get_type(ty).classifier()
}

fn find_field_in(
    builder: &IrBuilder,
    members: &[DeclIndex],
    name: &str,
) -> Option<DeclIndex> {
    members.iter().find_map(|idx| {
        let decl = builder.ir.get_decl(*idx);
        match &decl.kind {
            DeclKind::Field(_) if decl.name == name => Some(*idx),
            DeclKind::Property(p) if decl.name == name => p.backing_field,
            _ => None,
        }
    })
}

fn unresolved(
    builder: &IrBuilder,
    scope: &ScriptScope,
    name: &str,
    span: Span,
) -> LoweringError {
    LoweringError::UnresolvedName {
        span,
        name: name.to_string(),
        container: scope.script_name.clone(),
        path: builder.current_file_path(),
    }
}
