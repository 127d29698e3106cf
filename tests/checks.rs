use skiff::check::{check_unit, diagnostic_to_report, DiagnosticKind};
use skiff::ir::{
    ClassKind, ConstValue, DeclKind, Expr, Span, Statement, StatementKind,
};

mod common;
use common::builder_with_module;

fn str_body() -> Vec<Statement> {
    vec![Statement {
        span: None,
        kind: StatementKind::Return(Expr::Const(ConstValue::Str("x".to_string()))),
    }]
}

#[test]
fn any_method_with_body_in_interface_is_reported() {
    let (mut builder, module) = builder_with_module("lib");
    let interface = builder.add_class(module, "Printable", ClassKind::Interface, Span::new(0, 40));
    let string_ty = builder.ir.get_string_ty();
    let method = builder.add_function(interface, "str", string_ty, Span::new(10, 20));
    match &mut builder.ir.get_decl_mut(method).kind {
        DeclKind::Function(f) => {
            f.is_override = true;
            f.body = Some(str_body());
        }
        _ => unreachable!(),
    }

    let diagnostics = check_unit(&builder);
    assert_eq!(diagnostics.len(), 1, "{:#?}", diagnostics);
    assert!(matches!(
        &diagnostics[0].kind,
        DiagnosticKind::AnyMethodImplementedInInterface { method } if method == "str"
    ));
    // Rendering must not panic.
    let _report = diagnostic_to_report(&diagnostics[0]);
}

#[test]
fn interface_declarations_without_bodies_pass() {
    let (mut builder, module) = builder_with_module("lib");
    let interface = builder.add_class(module, "Printable", ClassKind::Interface, Span::new(0, 40));
    let string_ty = builder.ir.get_string_ty();
    let method = builder.add_function(interface, "str", string_ty, Span::new(10, 20));
    match &mut builder.ir.get_decl_mut(method).kind {
        DeclKind::Function(f) => f.is_override = true,
        _ => unreachable!(),
    }

    assert!(check_unit(&builder).is_empty());
}

#[test]
fn non_universal_methods_are_not_reported() {
    let (mut builder, module) = builder_with_module("lib");
    let interface = builder.add_class(module, "Printable", ClassKind::Interface, Span::new(0, 40));
    let string_ty = builder.ir.get_string_ty();
    let method = builder.add_function(interface, "pretty", string_ty, Span::new(10, 20));
    match &mut builder.ir.get_decl_mut(method).kind {
        DeclKind::Function(f) => {
            f.is_override = true;
            f.body = Some(str_body());
        }
        _ => unreachable!(),
    }

    assert!(check_unit(&builder).is_empty());
}

#[test]
fn classes_may_implement_universal_methods() {
    let (mut builder, module) = builder_with_module("lib");
    let class = builder.add_class(module, "Point", ClassKind::Class, Span::new(0, 40));
    let string_ty = builder.ir.get_string_ty();
    let method = builder.add_function(class, "str", string_ty, Span::new(10, 20));
    match &mut builder.ir.get_decl_mut(method).kind {
        DeclKind::Function(f) => {
            f.is_override = true;
            f.body = Some(str_body());
        }
        _ => unreachable!(),
    }

    assert!(check_unit(&builder).is_empty());
}
