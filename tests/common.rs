#![allow(dead_code)]

use std::path::Path;

use skiff::ir::lowering::IrBuilder;
use skiff::ir::{
    ClassKind, ConstValue, DeclIndex, Expr, ModuleIndex, Span, StatementKind, Statement, Type,
    TypeIndex,
};
use skiff::sem::SemExpr;
use skiff::stm::{
    GET_CONTEXT_METHOD, GET_VAR_METHOD, RUN_ATOMICALLY_METHOD, SEARCH_METHOD, SET_VAR_METHOD,
    STM_CONTEXT_CLASS, STM_INTERFACE, STM_PACKAGE, STM_SEARCHER, UNIVERSAL_DELEGATE, WRAP_METHOD,
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn builder_with_module(name: &str) -> (IrBuilder, ModuleIndex) {
    init_logging();
    let mut builder = IrBuilder::new();
    let path = format!("{name}.sk");
    let module = builder.add_module(name, "app", Path::new(&path), Span::new(0, 0));
    (builder, module)
}

pub fn lit(value: i64, at: usize) -> SemExpr {
    SemExpr::Literal {
        value: ConstValue::Int(value),
        span: Span::new(at, at + 1),
    }
}

pub fn name(name: &str, at: usize) -> SemExpr {
    SemExpr::Name {
        name: name.to_string(),
        span: Span::new(at, at + name.len()),
    }
}

/// The resolved STM runtime declarations a test unit depends on.
pub struct StmRuntimeFixture {
    pub searcher: DeclIndex,
    pub stm: DeclIndex,
    pub delegate: DeclIndex,
    pub context: DeclIndex,
    pub context_ty: TypeIndex,
    pub run_atomically: DeclIndex,
    pub get_var: DeclIndex,
    pub set_var: DeclIndex,
    pub wrap: DeclIndex,
    pub search: DeclIndex,
}

pub fn register_stm_runtime(builder: &mut IrBuilder) -> StmRuntimeFixture {
    register_stm_runtime_except(builder, &[])
}

/// Registers the STM runtime, leaving out the named classes or methods so
/// configuration failures can be provoked.
pub fn register_stm_runtime_except(builder: &mut IrBuilder, skip: &[&str]) -> StmRuntimeFixture {
    let span = Span::new(0, 0);
    let mut fixture = StmRuntimeFixture {
        searcher: builder.ir.any_class,
        stm: builder.ir.any_class,
        delegate: builder.ir.any_class,
        context: builder.ir.any_class,
        context_ty: builder.ir.get_unit_ty(),
        run_atomically: builder.ir.any_class,
        get_var: builder.ir.any_class,
        set_var: builder.ir.any_class,
        wrap: builder.ir.any_class,
        search: builder.ir.any_class,
    };

    if !skip.contains(&STM_CONTEXT_CLASS) {
        fixture.context = builder.register_dependency_class(
            STM_PACKAGE,
            STM_CONTEXT_CLASS,
            ClassKind::Class,
        );
        fixture.context_ty = builder.class_type(fixture.context);
    }
    if !skip.contains(&UNIVERSAL_DELEGATE) {
        fixture.delegate = builder.register_dependency_class(
            STM_PACKAGE,
            UNIVERSAL_DELEGATE,
            ClassKind::Class,
        );
    }
    let delegate_ty = builder.class_type(fixture.delegate);

    if !skip.contains(&STM_INTERFACE) {
        fixture.stm =
            builder.register_dependency_class(STM_PACKAGE, STM_INTERFACE, ClassKind::Interface);
        let stm_ty = builder.class_type(fixture.stm);
        let any_class = builder.ir.any_class;
        let any_ty = builder.class_type(any_class);
        let nullable_any = builder.add_type(Type::Nullable(any_ty));
        let nullable_ctx = builder.add_type(Type::Nullable(fixture.context_ty));
        let unit_ty = builder.ir.get_unit_ty();

        if !skip.contains(&WRAP_METHOD) {
            fixture.wrap = builder.add_function(fixture.stm, WRAP_METHOD, delegate_ty, span);
            builder.add_value_parameter(
                fixture.wrap,
                "value",
                nullable_any,
                skiff::ir::DeclOrigin::Defined,
            );
        }
        if !skip.contains(&GET_VAR_METHOD) {
            fixture.get_var = builder.add_function(fixture.stm, GET_VAR_METHOD, nullable_any, span);
            builder.add_value_parameter(
                fixture.get_var,
                "ctx",
                nullable_ctx,
                skiff::ir::DeclOrigin::Defined,
            );
            builder.add_value_parameter(
                fixture.get_var,
                "delegate",
                delegate_ty,
                skiff::ir::DeclOrigin::Defined,
            );
        }
        if !skip.contains(&SET_VAR_METHOD) {
            fixture.set_var = builder.add_function(fixture.stm, SET_VAR_METHOD, unit_ty, span);
            builder.add_value_parameter(
                fixture.set_var,
                "ctx",
                nullable_ctx,
                skiff::ir::DeclOrigin::Defined,
            );
            builder.add_value_parameter(
                fixture.set_var,
                "delegate",
                delegate_ty,
                skiff::ir::DeclOrigin::Defined,
            );
            builder.add_value_parameter(
                fixture.set_var,
                "value",
                nullable_any,
                skiff::ir::DeclOrigin::Defined,
            );
        }
        if !skip.contains(&RUN_ATOMICALLY_METHOD) {
            fixture.run_atomically =
                builder.add_function(fixture.stm, RUN_ATOMICALLY_METHOD, nullable_any, span);
            builder.add_value_parameter(
                fixture.run_atomically,
                "ctx",
                nullable_ctx,
                skiff::ir::DeclOrigin::Defined,
            );
            let block_ty = builder.add_type(Type::Function {
                params: vec![fixture.context_ty],
                ret: nullable_any,
            });
            builder.add_value_parameter(
                fixture.run_atomically,
                "block",
                block_ty,
                skiff::ir::DeclOrigin::Defined,
            );
        }
        if !skip.contains(&GET_CONTEXT_METHOD) {
            builder.add_function(fixture.stm, GET_CONTEXT_METHOD, fixture.context_ty, span);
        }
    }

    if !skip.contains(&STM_SEARCHER) {
        fixture.searcher =
            builder.register_dependency_class(STM_PACKAGE, STM_SEARCHER, ClassKind::Class);
        if !skip.contains(&SEARCH_METHOD) {
            let stm_ty = builder.class_type(fixture.stm);
            fixture.search = builder.add_function(fixture.searcher, SEARCH_METHOD, stm_ty, span);
        }
    }

    fixture
}

/// A shared class with mutable fields `a`, `b` and methods `m1`, `m2` whose
/// bodies read the fields.
pub struct SharedClassFixture {
    pub class: DeclIndex,
    pub field_a: DeclIndex,
    pub field_b: DeclIndex,
    pub m1: DeclIndex,
    pub m2: DeclIndex,
}

pub fn build_shared_class(
    builder: &mut IrBuilder,
    module: ModuleIndex,
    class_name: &str,
) -> SharedClassFixture {
    let span = Span::new(0, 0);
    let int_ty = builder.ir.get_int_ty();
    let class = builder.add_class(module, class_name, ClassKind::Class, span);
    builder.add_property(
        class,
        "a",
        int_ty,
        true,
        Some(Expr::Const(ConstValue::Int(1))),
        span,
    );
    builder.add_property(
        class,
        "b",
        int_ty,
        true,
        Some(Expr::Const(ConstValue::Int(2))),
        span,
    );
    let field_a = builder.ir.find_member_field(class, "a").unwrap();
    let field_b = builder.ir.find_member_field(class, "b").unwrap();

    let m1 = builder.add_function(class, "m1", int_ty, span);
    let m1_this = builder.ir.expect_function(m1).dispatch_receiver.unwrap();
    set_body(
        builder,
        m1,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::GetField {
                receiver: Box::new(Expr::GetValue { value: m1_this }),
                field: field_a,
            }),
        }],
    );

    let m2 = builder.add_function(class, "m2", int_ty, span);
    let m2_this = builder.ir.expect_function(m2).dispatch_receiver.unwrap();
    set_body(
        builder,
        m2,
        vec![Statement {
            span: None,
            kind: StatementKind::Return(Expr::GetField {
                receiver: Box::new(Expr::GetValue { value: m2_this }),
                field: field_b,
            }),
        }],
    );

    SharedClassFixture {
        class,
        field_a,
        field_b,
        m1,
        m2,
    }
}

pub fn set_body(builder: &mut IrBuilder, function: DeclIndex, body: Vec<Statement>) {
    match &mut builder.ir.get_decl_mut(function).kind {
        skiff::ir::DeclKind::Function(f) => f.body = Some(body),
        _ => panic!("expected a function"),
    }
}
