use skiff::ir::{
    ClassKind, DeclKind, DeclOrigin, Expr, Span, Statement, StatementKind,
};
use skiff::stm::{
    getter_name, patch_module, patch_shared_class, setter_name, StmError, DELEGATE_SUFFIX,
    RUN_ATOMICALLY_METHOD, STM_CONTEXT_CLASS, STM_FIELD_NAME, STM_INTERFACE, STM_PACKAGE,
    STM_SEARCHER, UNIVERSAL_DELEGATE,
};
use test_case::test_case;

mod common;
use common::{
    build_shared_class, builder_with_module, register_stm_runtime, register_stm_runtime_except,
    set_body,
};

#[test]
fn shared_class_gains_manager_delegates_and_wrapped_methods() {
    let (mut builder, module) = builder_with_module("bank");
    let runtime = register_stm_runtime(&mut builder);
    let shared = build_shared_class(&mut builder, module, "Account");

    patch_module(&mut builder, module, &[shared.class], &[]).unwrap();

    let class = builder.ir.expect_class(shared.class).clone();

    // Exactly one runtime-manager field, private and final, initialized by
    // the searcher.
    let managers: Vec<_> = class
        .members
        .iter()
        .copied()
        .filter(|idx| {
            let decl = builder.ir.get_decl(*idx);
            matches!(decl.kind, DeclKind::Field(_)) && decl.name == STM_FIELD_NAME
        })
        .collect();
    assert_eq!(managers.len(), 1);
    let DeclKind::Field(manager) = &builder.ir.get_decl(managers[0]).kind else {
        unreachable!()
    };
    assert!(manager.is_final);
    assert!(matches!(
        &manager.initializer,
        Some(Expr::Call { callee, .. }) if *callee == runtime.search
    ));

    // Exactly two delegate fields, suffix-tagged, in field order.
    let delegates: Vec<String> = class
        .members
        .iter()
        .map(|idx| builder.ir.get_decl(*idx))
        .filter(|decl| {
            matches!(decl.kind, DeclKind::Field(_)) && decl.name.ends_with(DELEGATE_SUFFIX)
        })
        .map(|decl| decl.name.clone())
        .collect();
    assert_eq!(delegates, vec!["a$delegate", "b$delegate"]);

    for accessor in [
        getter_name("a"),
        setter_name("a"),
        getter_name("b"),
        setter_name("b"),
    ] {
        assert!(
            builder
                .ir
                .find_member_function(shared.class, &accessor)
                .is_some(),
            "missing generated accessor {accessor}"
        );
    }

    // The original properties were replaced by their accessors.
    assert!(!class
        .members
        .iter()
        .any(|idx| matches!(builder.ir.get_decl(*idx).kind, DeclKind::Property(_))));

    // Each method body is a single runAtomically call: null context (a
    // top-level entry starts a new transaction) plus the closure holding the
    // original body, with field reads routed through the accessors and the
    // closure's context parameter threaded in.
    for method in [shared.m1, shared.m2] {
        let body = builder.ir.expect_function(method).body.clone().unwrap();
        assert_eq!(body.len(), 1, "{:#?}", body);
        let StatementKind::Return(Expr::Call { callee, args, .. }) = &body[0].kind else {
            panic!("expected a runAtomically call: {:#?}", body[0]);
        };
        assert_eq!(*callee, runtime.run_atomically);
        assert!(matches!(args[0], Expr::Null(_)), "{:#?}", args[0]);

        let Expr::Closure { function, .. } = &args[1] else {
            panic!("expected a closure argument: {:#?}", args[1]);
        };
        let closure = builder.ir.expect_function(*function);
        let ctx_param = *closure.params.last().unwrap();
        let closure_body = closure.body.as_ref().unwrap();
        let StatementKind::Return(Expr::Call {
            callee: getter,
            args: getter_args,
            ..
        }) = &closure_body[0].kind
        else {
            panic!("expected an accessor call: {:#?}", closure_body[0]);
        };
        assert!(builder.ir.get_decl(*getter).name.starts_with("get$"));
        assert!(matches!(
            getter_args[0],
            Expr::GetValue { value } if value == ctx_param
        ));
    }
}

#[test]
fn mandatory_context_call_with_no_enclosing_context_fails() {
    let (mut builder, module) = builder_with_module("tasks");
    register_stm_runtime(&mut builder);
    let unit_ty = builder.ir.get_unit_ty();

    let do_work = builder.add_top_level_function(module, "doWork", unit_ty, Span::new(0, 10));
    set_body(&mut builder, do_work, Vec::new());

    let caller = builder.add_top_level_function(module, "caller", unit_ty, Span::new(10, 20));
    set_body(
        &mut builder,
        caller,
        vec![Statement {
            span: None,
            kind: StatementKind::Expr(Expr::Call {
                callee: do_work,
                receiver: None,
                args: Vec::new(),
                ty: unit_ty,
            }),
        }],
    );

    let error =
        patch_module(&mut builder, module, &[], &[do_work]).expect_err("expected error");
    assert!(
        matches!(
            &error,
            StmError::MissingContext { function } if function == "doWork"
        ),
        "{:#?}",
        error
    );
}

#[test]
fn transformed_calls_get_the_nearest_context_appended() {
    let (mut builder, module) = builder_with_module("tasks");
    let runtime = register_stm_runtime(&mut builder);
    let int_ty = builder.ir.get_int_ty();

    let do_work = builder.add_top_level_function(module, "doWork", int_ty, Span::new(0, 10));
    let n_param = builder.add_value_parameter(do_work, "n", int_ty, DeclOrigin::Defined);
    set_body(
        &mut builder,
        do_work,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::GetValue { value: n_param }),
        }],
    );

    let caller = builder.add_top_level_function(module, "caller", int_ty, Span::new(10, 20));
    let ctx_param =
        builder.add_value_parameter(caller, "ctx", runtime.context_ty, DeclOrigin::Defined);
    set_body(
        &mut builder,
        caller,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::Call {
                callee: do_work,
                receiver: None,
                args: vec![Expr::Const(skiff::ir::ConstValue::Int(5))],
                ty: int_ty,
            }),
        }],
    );

    patch_module(&mut builder, module, &[], &[do_work]).unwrap();

    // The atomic function was rebuilt with a trailing context parameter and
    // its body reads the rebuilt parameter.
    let new_do_work = builder.ir.modules[module]
        .declarations
        .iter()
        .copied()
        .find(|idx| builder.ir.get_decl(*idx).name == "doWork")
        .unwrap();
    assert_ne!(new_do_work, do_work);
    assert_eq!(builder.ir.get_decl(new_do_work).origin, DeclOrigin::StmPlugin);
    let new_fn = builder.ir.expect_function(new_do_work).clone();
    assert_eq!(new_fn.params.len(), 2);
    let new_n = new_fn.params[0];
    assert_ne!(new_n, n_param);
    let new_ctx = new_fn.params[1];
    assert_eq!(builder.ir.get_decl(new_ctx).name, "ctx");
    assert!(matches!(
        &new_fn.body.as_ref().unwrap()[0].kind,
        StatementKind::Return(Expr::GetValue { value }) if *value == new_n
    ));

    // The call site was redirected with the caller's context appended.
    let caller_body = builder.ir.expect_function(caller).body.clone().unwrap();
    let StatementKind::Return(Expr::Call { callee, args, .. }) = &caller_body[0].kind else {
        panic!("expected a call: {:#?}", caller_body[0]);
    };
    assert_eq!(*callee, new_do_work);
    assert_eq!(args.len(), 2);
    assert!(matches!(
        args[1],
        Expr::GetValue { value } if value == ctx_param
    ));
}

#[test_case(STM_SEARCHER ; "searcher class")]
#[test_case(STM_INTERFACE ; "stm interface")]
#[test_case(UNIVERSAL_DELEGATE ; "universal delegate")]
#[test_case(STM_CONTEXT_CLASS ; "context class")]
fn missing_runtime_class_aborts_without_mutating(skip: &str) {
    let (mut builder, module) = builder_with_module("bank");
    register_stm_runtime_except(&mut builder, &[skip]);
    let shared = build_shared_class(&mut builder, module, "Account");
    let members_before = builder.ir.expect_class(shared.class).members.clone();

    let error =
        patch_shared_class(&mut builder, module, shared.class).expect_err("expected error");
    assert!(
        matches!(
            &error,
            StmError::RuntimeClassNotFound { class, .. }
                if class.name == skip && class.package == STM_PACKAGE
        ),
        "{:#?}",
        error
    );
    // All-or-nothing: the class was not touched.
    assert_eq!(builder.ir.expect_class(shared.class).members, members_before);
}

#[test]
fn missing_runtime_method_aborts_without_mutating() {
    let (mut builder, module) = builder_with_module("bank");
    register_stm_runtime_except(&mut builder, &[RUN_ATOMICALLY_METHOD]);
    let shared = build_shared_class(&mut builder, module, "Account");
    let members_before = builder.ir.expect_class(shared.class).members.clone();

    let error =
        patch_shared_class(&mut builder, module, shared.class).expect_err("expected error");
    assert!(
        matches!(
            &error,
            StmError::RuntimeMethodNotFound { class, method, .. }
                if class == STM_INTERFACE && method == RUN_ATOMICALLY_METHOD
        ),
        "{:#?}",
        error
    );
    assert_eq!(builder.ir.expect_class(shared.class).members, members_before);
}

#[test]
fn field_access_on_shared_classes_is_redirected_to_accessors() {
    let (mut builder, module) = builder_with_module("bank");
    let runtime = register_stm_runtime(&mut builder);
    let shared = build_shared_class(&mut builder, module, "Account");
    let int_ty = builder.ir.get_int_ty();

    let audit = builder.add_class(module, "Audit", ClassKind::Class, Span::new(0, 10));
    let read = builder.add_function(audit, "read", int_ty, Span::new(0, 5));
    let account_ty = builder.class_type(shared.class);
    let account_param =
        builder.add_value_parameter(read, "account", account_ty, DeclOrigin::Defined);
    set_body(
        &mut builder,
        read,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::GetField {
                receiver: Box::new(Expr::GetValue {
                    value: account_param,
                }),
                field: shared.field_a,
            }),
        }],
    );

    let read_tx = builder.add_function(audit, "readTx", int_ty, Span::new(5, 10));
    let account_param_tx =
        builder.add_value_parameter(read_tx, "account", account_ty, DeclOrigin::Defined);
    let ctx_param =
        builder.add_value_parameter(read_tx, "ctx", runtime.context_ty, DeclOrigin::Defined);
    set_body(
        &mut builder,
        read_tx,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::GetField {
                receiver: Box::new(Expr::GetValue {
                    value: account_param_tx,
                }),
                field: shared.field_a,
            }),
        }],
    );

    patch_module(&mut builder, module, &[shared.class], &[]).unwrap();

    let getter = builder
        .ir
        .find_member_function(shared.class, &getter_name("a"))
        .unwrap();

    // Without an enclosing context the accessor gets a typed null.
    let read_body = builder.ir.expect_function(read).body.clone().unwrap();
    let StatementKind::Return(Expr::Call { callee, args, .. }) = &read_body[0].kind else {
        panic!("expected an accessor call: {:#?}", read_body[0]);
    };
    assert_eq!(*callee, getter);
    assert!(matches!(args[0], Expr::Null(_)));

    // With a trailing context parameter the nearest enclosing context wins.
    let read_tx_body = builder.ir.expect_function(read_tx).body.clone().unwrap();
    let StatementKind::Return(Expr::Call { callee, args, .. }) = &read_tx_body[0].kind else {
        panic!("expected an accessor call: {:#?}", read_tx_body[0]);
    };
    assert_eq!(*callee, getter);
    assert!(matches!(
        args[0],
        Expr::GetValue { value } if value == ctx_param
    ));
}
