//! Declaration builder helpers on [`IrBuilder`].
//!
//! Lowering passes, the STM rewrite and tests all assemble declarations
//! through these; nothing else inserts into the declaration arena directly.

use std::collections::HashMap;
use std::path::Path;

use crate::ir::{
    lowering::{IrBuilder, SymbolTable},
    Annotation, ClassBody, ClassKind, DeclIndex, DeclKind, DeclOrigin, Declaration, Declarations,
    Expr, FieldBody, FunctionBody, FunctionKind, IrUnit, ModuleBody, ModuleIndex, Modules,
    ParamBody, PropertyBody, QualifiedName, Span, Type, TypeIndex, Types, Visibility,
};

/// Package holding the compiler-known builtin declarations.
pub const LANG_PACKAGE: &str = "lang";
/// Name of the universal base class.
pub const UNIVERSAL_BASE_NAME: &str = "Any";
/// IR-level name of constructors.
pub const CONSTRUCTOR_NAME: &str = "<init>";
/// IR-level name of instance receivers.
pub const THIS_NAME: &str = "this";

impl IrBuilder {
    pub fn new() -> Self {
        let mut types = Types::new();
        let mut builtin_types = HashMap::new();
        for kind in [Type::Unit, Type::Bool, Type::Int, Type::Float, Type::String] {
            builtin_types.insert(kind.clone(), types.insert(Some(kind)));
        }

        let mut decls = Declarations::new();
        // Reserve the universal base class slot before anything references it.
        let any_class = decls.insert(None);

        let mut builder = Self {
            ir: IrUnit {
                decls,
                types,
                modules: Modules::new(),
                top_level_modules: Vec::new(),
                builtin_types,
                any_class,
            },
            symbols: SymbolTable::default(),
            local_module: None,
            class_types: HashMap::new(),
            sem_type_cache: HashMap::new(),
        };
        builder.install_universal_base();
        builder
    }

    fn install_universal_base(&mut self) {
        let any_class = self.ir.any_class;
        let any_ty = self.class_type(any_class);
        let span = Span::new(0, 0);

        self.ir.decls[any_class] = Some(Declaration {
            name: UNIVERSAL_BASE_NAME.to_string(),
            span,
            parent: None,
            origin: DeclOrigin::Defined,
            ty: any_ty,
            kind: DeclKind::Class(ClassBody {
                kind: ClassKind::Class,
                superclass: None,
                this_receiver: None,
                members: Vec::new(),
                annotations: Vec::new(),
                metadata: None,
            }),
        });
        let receiver = self.create_this_receiver(any_class);
        match &mut self.ir.get_decl_mut(any_class).kind {
            DeclKind::Class(body) => body.this_receiver = Some(receiver),
            _ => unreachable!(),
        }

        self.add_constructor(any_class, span);

        let bool_ty = self.ir.get_bool_ty();
        let int_ty = self.ir.get_int_ty();
        let string_ty = self.ir.get_string_ty();
        let nullable_any = self.add_type(Type::Nullable(any_ty));

        let equals = self.add_function(any_class, "equals", bool_ty, span);
        self.add_value_parameter(equals, "other", nullable_any, DeclOrigin::Defined);
        self.add_function(any_class, "hash", int_ty, span);
        self.add_function(any_class, "str", string_ty, span);

        self.symbols.classes.insert(
            QualifiedName::new(LANG_PACKAGE, UNIVERSAL_BASE_NAME),
            any_class,
        );
    }

    pub fn add_module(
        &mut self,
        name: &str,
        package: &str,
        file_path: &Path,
        span: Span,
    ) -> ModuleIndex {
        let idx = self.ir.modules.insert(ModuleBody {
            name: name.to_string(),
            package: package.to_string(),
            declarations: Vec::new(),
            annotations: Vec::new(),
            metadata: None,
            span,
            file_path: file_path.to_path_buf(),
        });
        self.ir.top_level_modules.push(idx);
        idx
    }

    /// Adds a class to a module's top-level declaration list and registers
    /// its qualified name. The implicit `this` receiver is created with it.
    pub fn add_class(
        &mut self,
        module_idx: ModuleIndex,
        name: &str,
        kind: ClassKind,
        span: Span,
    ) -> DeclIndex {
        let package = self.ir.modules[module_idx].package.clone();
        let idx = self.new_class(&package, name, kind, DeclOrigin::Defined, span);
        self.ir.modules[module_idx].declarations.push(idx);
        idx
    }

    /// Registers a class that lives in a dependency of this unit rather than
    /// in one of its modules. Stands in for the classpath collaborator.
    pub fn register_dependency_class(
        &mut self,
        package: &str,
        name: &str,
        kind: ClassKind,
    ) -> DeclIndex {
        self.new_class(package, name, kind, DeclOrigin::Defined, Span::new(0, 0))
    }

    pub(crate) fn new_class(
        &mut self,
        package: &str,
        name: &str,
        kind: ClassKind,
        origin: DeclOrigin,
        span: Span,
    ) -> DeclIndex {
        let idx = self.ir.decls.insert(None);
        let ty = self.class_type(idx);
        let superclass = self.class_type(self.ir.any_class);
        self.ir.decls[idx] = Some(Declaration {
            name: name.to_string(),
            span,
            parent: None,
            origin,
            ty,
            kind: DeclKind::Class(ClassBody {
                kind,
                superclass: Some(superclass),
                this_receiver: None,
                members: Vec::new(),
                annotations: Vec::new(),
                metadata: None,
            }),
        });
        let receiver = self.create_this_receiver(idx);
        match &mut self.ir.get_decl_mut(idx).kind {
            DeclKind::Class(body) => body.this_receiver = Some(receiver),
            _ => unreachable!(),
        }
        self.symbols
            .classes
            .insert(QualifiedName::new(package, name), idx);
        idx
    }

    pub(crate) fn create_this_receiver(&mut self, class: DeclIndex) -> DeclIndex {
        let ty = self.class_type(class);
        let span = self.ir.get_decl(class).span;
        self.ir.decls.insert(Some(Declaration {
            name: THIS_NAME.to_string(),
            span,
            parent: Some(class),
            origin: DeclOrigin::InstanceReceiver,
            ty,
            kind: DeclKind::ValueParameter(ParamBody {
                default_value: None,
            }),
        }))
    }

    /// Adds a member function to a class, with a dispatch receiver copied
    /// from the class `this` receiver.
    pub fn add_function(
        &mut self,
        class: DeclIndex,
        name: &str,
        ret_ty: TypeIndex,
        span: Span,
    ) -> DeclIndex {
        self.add_function_with(class, name, FunctionKind::Method, ret_ty, span)
    }

    pub fn add_function_with(
        &mut self,
        class: DeclIndex,
        name: &str,
        kind: FunctionKind,
        ret_ty: TypeIndex,
        span: Span,
    ) -> DeclIndex {
        let idx = self.ir.decls.insert(Some(Declaration {
            name: name.to_string(),
            span,
            parent: Some(class),
            origin: DeclOrigin::Defined,
            ty: ret_ty,
            kind: DeclKind::Function(FunctionBody {
                kind,
                dispatch_receiver: None,
                params: Vec::new(),
                ret_ty,
                is_override: false,
                body: None,
            }),
        }));
        let receiver = self
            .ir
            .expect_class(class)
            .this_receiver
            .map(|r| self.copy_param_to(r, idx));
        match &mut self.ir.get_decl_mut(idx).kind {
            DeclKind::Function(f) => f.dispatch_receiver = receiver,
            _ => unreachable!(),
        }
        match &mut self.ir.get_decl_mut(class).kind {
            DeclKind::Class(body) => body.members.push(idx),
            other => panic!("cannot add a function to a {}", other.kind_name()),
        }
        idx
    }

    pub fn add_constructor(&mut self, class: DeclIndex, span: Span) -> DeclIndex {
        let class_ty = self.class_type(class);
        let idx = self.ir.decls.insert(Some(Declaration {
            name: CONSTRUCTOR_NAME.to_string(),
            span,
            parent: Some(class),
            origin: DeclOrigin::Defined,
            ty: class_ty,
            kind: DeclKind::Function(FunctionBody {
                kind: FunctionKind::Constructor,
                dispatch_receiver: None,
                params: Vec::new(),
                ret_ty: class_ty,
                is_override: false,
                body: None,
            }),
        }));
        match &mut self.ir.get_decl_mut(class).kind {
            DeclKind::Class(body) => body.members.push(idx),
            other => panic!("cannot add a constructor to a {}", other.kind_name()),
        }
        idx
    }

    /// Adds a free function to a module's top-level declaration list.
    pub fn add_top_level_function(
        &mut self,
        module_idx: ModuleIndex,
        name: &str,
        ret_ty: TypeIndex,
        span: Span,
    ) -> DeclIndex {
        let idx = self.ir.decls.insert(Some(Declaration {
            name: name.to_string(),
            span,
            parent: None,
            origin: DeclOrigin::Defined,
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
        self.ir.modules[module_idx].declarations.push(idx);
        idx
    }

    pub fn add_value_parameter(
        &mut self,
        function: DeclIndex,
        name: &str,
        ty: TypeIndex,
        origin: DeclOrigin,
    ) -> DeclIndex {
        let span = self.ir.get_decl(function).span;
        let idx = self.ir.decls.insert(Some(Declaration {
            name: name.to_string(),
            span,
            parent: Some(function),
            origin,
            ty,
            kind: DeclKind::ValueParameter(ParamBody {
                default_value: None,
            }),
        }));
        match &mut self.ir.get_decl_mut(function).kind {
            DeclKind::Function(f) => f.params.push(idx),
            other => panic!("cannot add a parameter to a {}", other.kind_name()),
        }
        idx
    }

    /// Clones a value parameter under a new owner. Used for dispatch
    /// receivers of generated accessors.
    pub fn copy_param_to(&mut self, param: DeclIndex, new_owner: DeclIndex) -> DeclIndex {
        let mut decl = self.ir.get_decl(param).clone();
        decl.parent = Some(new_owner);
        self.ir.decls.insert(Some(decl))
    }

    /// Creates a field declaration without attaching it anywhere. Used for
    /// property backing fields.
    pub fn build_field(
        &mut self,
        parent: DeclIndex,
        name: &str,
        ty: TypeIndex,
        visibility: Visibility,
        origin: DeclOrigin,
        initializer: Option<Expr>,
    ) -> DeclIndex {
        let span = self.ir.get_decl(parent).span;
        self.ir.decls.insert(Some(Declaration {
            name: name.to_string(),
            span,
            parent: Some(parent),
            origin,
            ty,
            kind: DeclKind::Field(FieldBody {
                visibility,
                is_final: false,
                initializer,
            }),
        }))
    }

    /// Adds a field to a class's member list.
    pub fn add_field(
        &mut self,
        class: DeclIndex,
        name: &str,
        ty: TypeIndex,
        visibility: Visibility,
        origin: DeclOrigin,
        initializer: Option<Expr>,
    ) -> DeclIndex {
        let idx = self.build_field(class, name, ty, visibility, origin, initializer);
        match &mut self.ir.get_decl_mut(class).kind {
            DeclKind::Class(body) => body.members.push(idx),
            other => panic!("cannot add a field to a {}", other.kind_name()),
        }
        idx
    }

    /// Adds a field-backed property to a class's member list. Returns the
    /// property; the backing field is reachable through it.
    pub fn add_property(
        &mut self,
        class: DeclIndex,
        name: &str,
        ty: TypeIndex,
        mutable: bool,
        initializer: Option<Expr>,
        span: Span,
    ) -> DeclIndex {
        let field = self.build_field(
            class,
            name,
            ty,
            Visibility::Private,
            DeclOrigin::Defined,
            initializer,
        );
        let idx = self.ir.decls.insert(Some(Declaration {
            name: name.to_string(),
            span,
            parent: Some(class),
            origin: DeclOrigin::Defined,
            ty,
            kind: DeclKind::Property(PropertyBody {
                mutable,
                backing_field: Some(field),
                getter: None,
                setter: None,
            }),
        }));
        self.ir.get_decl_mut(field).parent = Some(idx);
        match &mut self.ir.get_decl_mut(class).kind {
            DeclKind::Class(body) => body.members.push(idx),
            other => panic!("cannot add a property to a {}", other.kind_name()),
        }
        idx
    }

    pub fn add_annotation(&mut self, module_idx: ModuleIndex, name: &str, span: Span) {
        self.ir.modules[module_idx].annotations.push(Annotation {
            name: name.to_string(),
            span,
        });
    }
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}
