use tracing::{debug, instrument};

use crate::ir::{
    lowering::{
        copy::copy_expr, copy_decl, copy_statement, remap_type, IrBuilder, LoweringError,
        SymbolRemapper,
    },
    ClassKind, DeclIndex, DeclKind, DeclOrigin, Declaration, Expr, FunctionBody, FunctionKind,
    ModuleIndex, PropertyBody, ScriptBody, Span, Statement, StatementKind, TypeIndex, Visibility,
};

/// Lowers every module of the unit, then checks the structural postcondition:
/// no script pseudo-declarations remain anywhere.
pub fn lower_unit(builder: &mut IrBuilder) -> Result<(), LoweringError> {
    for module_idx in builder.ir.top_level_modules.clone() {
        lower_module(builder, module_idx)?;
    }
    check_no_scripts_remain(builder)
}

/// Rewrites every script unit in the module into an ordinary class
/// declaration, in place.
#[instrument(level = "debug", skip_all, fields(module = ?builder.ir.modules[module_idx].name))]
pub fn lower_module(
    builder: &mut IrBuilder,
    module_idx: ModuleIndex,
) -> Result<(), LoweringError> {
    builder.local_module = Some(module_idx);

    let declarations = builder.ir.modules[module_idx].declarations.clone();
    for (position, decl_idx) in declarations.iter().enumerate() {
        if matches!(builder.ir.get_decl(*decl_idx).kind, DeclKind::Script(_)) {
            ScriptToClass::new(builder, module_idx, position, *decl_idx)?.run()?;
        }
    }
    Ok(())
}

/// Sanity check run after the pass: every top-level declaration in every
/// module must be an ordinary class, function or property.
pub fn check_no_scripts_remain(builder: &IrBuilder) -> Result<(), LoweringError> {
    for module_idx in &builder.ir.top_level_modules {
        let module = &builder.ir.modules[*module_idx];
        for decl_idx in &module.declarations {
            let decl = builder.ir.get_decl(*decl_idx);
            match &decl.kind {
                DeclKind::Class(_) | DeclKind::Function(_) | DeclKind::Property(_) => {}
                DeclKind::Script(_) => {
                    return Err(LoweringError::ScriptRemained {
                        span: decl.span,
                        name: decl.name.clone(),
                        path: module.file_path.clone(),
                    });
                }
                other => {
                    return Err(LoweringError::UnexpectedDeclaration {
                        name: decl.name.clone(),
                        expected: "class, function or property",
                        found: other.kind_name(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Drives one script unit through the lowering state machine:
/// `Pending -> ReceiverCopied -> MembersCopied -> ConstructorBuilt ->
/// Attached -> Done`, one method per transition.
struct ScriptToClass<'b> {
    builder: &'b mut IrBuilder,
    module_idx: ModuleIndex,
    /// Index of the script in the module's declaration list; the class lands
    /// at the same position.
    position: usize,
    script_idx: DeclIndex,
    class_idx: DeclIndex,
    remapper: SymbolRemapper,
    script: ScriptBody,
    name: String,
    span: Span,
}

impl<'b> ScriptToClass<'b> {
    fn new(
        builder: &'b mut IrBuilder,
        module_idx: ModuleIndex,
        position: usize,
        script_idx: DeclIndex,
    ) -> Result<Self, LoweringError> {
        let decl = builder.ir.get_decl(script_idx).clone();
        let DeclKind::Script(script) = decl.kind else {
            return Err(LoweringError::UnexpectedDeclaration {
                name: decl.name.clone(),
                expected: "script",
                found: decl.kind.kind_name(),
            });
        };

        let package = builder.ir.modules[module_idx].package.clone();
        let class_idx = builder.new_class(
            &package,
            &decl.name,
            ClassKind::Class,
            DeclOrigin::ScriptClass,
            decl.span,
        );
        match &mut builder.ir.get_decl_mut(class_idx).kind {
            DeclKind::Class(body) => body.superclass = Some(script.base_class),
            _ => unreachable!(),
        }

        let mut remapper = SymbolRemapper::new();
        remapper.seed(script_idx, class_idx);

        Ok(Self {
            builder,
            module_idx,
            position,
            script_idx,
            class_idx,
            remapper,
            script,
            name: decl.name,
            span: decl.span,
        })
    }

    fn run(mut self) -> Result<DeclIndex, LoweringError> {
        self.copy_receiver()?;
        self.mark_members();
        self.build_constructor()?;
        self.attach_members()?;
        self.replace_in_module();
        Ok(self.class_idx)
    }

    /// `Pending -> ReceiverCopied`: deep-copy the `this` receiver under the
    /// new class identity, replacing the placeholder receiver the class was
    /// created with.
    fn copy_receiver(&mut self) -> Result<(), LoweringError> {
        self.remapper
            .mark_decl(self.builder, self.script.this_receiver);
        let receiver = copy_decl(
            self.builder,
            &self.remapper,
            self.script.this_receiver,
            Some(self.class_idx),
        )?;
        match &mut self.builder.ir.get_decl_mut(self.class_idx).kind {
            DeclKind::Class(body) => body.this_receiver = Some(receiver),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// `ReceiverCopied -> MembersCopied`: register every member and statement
    /// with the remapper. No bodies are copied yet; this only reserves the
    /// identities the copies will have.
    fn mark_members(&mut self) {
        for member in self.script.members.clone() {
            self.remapper.mark_decl(self.builder, member);
        }
        for stmt in self.script.statements.clone() {
            self.remapper.mark_statement(self.builder, &stmt);
        }
    }

    /// `MembersCopied -> ConstructorBuilt`: synthesize the primary
    /// constructor. Each explicit call parameter becomes a constructor
    /// value-parameter with a backing field and a property whose getter reads
    /// the field through `this`; the body delegates to the universal base
    /// constructor, runs the instance initializers, then replays every script
    /// statement in source order.
    fn build_constructor(&mut self) -> Result<(), LoweringError> {
        let ctor = self.builder.add_constructor(self.class_idx, self.span);

        for old_param in self.script.explicit_call_parameters.clone() {
            let old = self.builder.ir.get_decl(old_param).clone();
            let param_ty = remap_type(self.builder, &self.remapper, old.ty);
            let ctor_param = self.builder.add_value_parameter(
                ctor,
                &old.name,
                param_ty,
                DeclOrigin::ScriptCallParameter,
            );
            if let DeclKind::ValueParameter(param_body) = old.kind {
                let default_value = param_body
                    .default_value
                    .map(|d| copy_expr(self.builder, &self.remapper, &d, ctor_param))
                    .transpose()?;
                match &mut self.builder.ir.get_decl_mut(ctor_param).kind {
                    DeclKind::ValueParameter(p) => p.default_value = default_value,
                    _ => unreachable!(),
                }
            }
            // Statement references to the script call parameter must land on
            // the constructor parameter.
            self.remapper.seed(old_param, ctor_param);

            self.add_parameter_property(ctor_param, &old.name, param_ty, old.span)?;
        }

        let any_ctor = self.builder.ir.any_constructor();
        let mut body = vec![
            Statement {
                span: None,
                kind: StatementKind::DelegatingConstructorCall {
                    ctor: any_ctor,
                    args: Vec::new(),
                },
            },
            Statement {
                span: None,
                kind: StatementKind::InstanceInitializer {
                    class: self.class_idx,
                },
            },
        ];
        for stmt in self.script.statements.clone() {
            body.push(copy_statement(self.builder, &self.remapper, &stmt, ctor)?);
        }
        match &mut self.builder.ir.get_decl_mut(ctor).kind {
            DeclKind::Function(f) => f.body = Some(body),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// One call parameter's property: backing field initialized from the
    /// constructor parameter, getter reading the field through `this`.
    fn add_parameter_property(
        &mut self,
        ctor_param: DeclIndex,
        name: &str,
        ty: TypeIndex,
        span: Span,
    ) -> Result<(), LoweringError> {
        let builder = &mut *self.builder;
        let property_idx = builder.ir.decls.insert(None);

        let field = builder.build_field(
            self.class_idx,
            name,
            ty,
            Visibility::Protected,
            DeclOrigin::FieldForScriptParameter,
            Some(Expr::GetValue { value: ctor_param }),
        );

        let getter_idx = builder.ir.decls.insert(None);
        let class_receiver = builder
            .ir
            .expect_class(self.class_idx)
            .this_receiver
            .ok_or_else(|| {
                LoweringError::Internal("script class lost its receiver".to_string())
            })?;
        let getter_receiver = builder.copy_param_to(class_receiver, getter_idx);
        builder.ir.decls[getter_idx] = Some(Declaration {
            name: format!("<get-{name}>"),
            span,
            parent: Some(property_idx),
            origin: DeclOrigin::Defined,
            ty,
            kind: DeclKind::Function(FunctionBody {
                kind: FunctionKind::Getter,
                dispatch_receiver: Some(getter_receiver),
                params: Vec::new(),
                ret_ty: ty,
                is_override: false,
                body: Some(vec![Statement {
                    span: None,
                    kind: StatementKind::Return(Expr::GetField {
                        receiver: Box::new(Expr::GetValue {
                            value: getter_receiver,
                        }),
                        field,
                    }),
                }]),
            }),
        });

        builder.ir.decls[property_idx] = Some(Declaration {
            name: name.to_string(),
            span,
            parent: Some(self.class_idx),
            origin: DeclOrigin::Defined,
            ty,
            kind: DeclKind::Property(PropertyBody {
                mutable: false,
                backing_field: Some(field),
                getter: Some(getter_idx),
                setter: None,
            }),
        });
        builder.ir.get_decl_mut(field).parent = Some(property_idx);
        match &mut builder.ir.get_decl_mut(self.class_idx).kind {
            DeclKind::Class(body) => body.members.push(property_idx),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// `ConstructorBuilt -> Attached`: deep-copy the remaining member
    /// declarations into the class, order preserved, and carry the module's
    /// annotations and metadata over.
    fn attach_members(&mut self) -> Result<(), LoweringError> {
        for member in self.script.members.clone() {
            let copy = copy_decl(self.builder, &self.remapper, member, Some(self.class_idx))?;
            match &mut self.builder.ir.get_decl_mut(self.class_idx).kind {
                DeclKind::Class(body) => body.members.push(copy),
                _ => unreachable!(),
            }
        }

        let module = &self.builder.ir.modules[self.module_idx];
        let annotations = module.annotations.clone();
        let metadata = module.metadata.clone();
        match &mut self.builder.ir.get_decl_mut(self.class_idx).kind {
            DeclKind::Class(body) => {
                body.annotations.extend(annotations);
                body.metadata = metadata;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// `Attached -> Done`: replace the script entry in the module's
    /// declaration list with the class, same index, and destroy the script.
    /// The module owned the script exactly once; nothing may see it again.
    fn replace_in_module(&mut self) {
        self.builder.ir.modules[self.module_idx].declarations[self.position] = self.class_idx;
        self.builder.ir.decls[self.script_idx] = None;
        debug!("script {:?} lowered to class at index {}", self.name, self.position);
    }
}
