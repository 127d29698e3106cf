use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;

use ariadne::{ColorGenerator, Label, Report, ReportKind};

use crate::ir::{
    lowering::{IrBuilder, LoweringError},
    ClassKind, DeclKind, FunctionKind, ModuleIndex, Span,
};

#[derive(Debug, Clone)]
pub struct FileSpan {
    pub span: Range<usize>,
    pub path: String,
}

impl FileSpan {
    pub fn new(path: String, span: Range<usize>) -> Self {
        Self { path, span }
    }
}

impl ariadne::Span for FileSpan {
    type SourceId = String;

    fn source(&self) -> &Self::SourceId {
        &self.path
    }

    fn start(&self) -> usize {
        self.span.start
    }

    fn end(&self) -> usize {
        self.span.end
    }
}

/// A non-fatal finding: recorded for user display, never alters the IR and
/// never aborts the pipeline.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub span: Span,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// An interface member overrides a method inherited from the universal
    /// base class and declares a body.
    AnyMethodImplementedInInterface { method: String },
}

/// Runs the declaration checks over every module of the unit.
pub fn check_unit(builder: &IrBuilder) -> Vec<Diagnostic> {
    builder
        .ir
        .top_level_modules
        .iter()
        .flat_map(|module_idx| check_module(builder, *module_idx))
        .collect()
}

pub fn check_module(builder: &IrBuilder, module_idx: ModuleIndex) -> Vec<Diagnostic> {
    let any_methods = universal_base_methods(builder);
    let module = &builder.ir.modules[module_idx];

    let mut diagnostics = Vec::new();
    for decl_idx in &module.declarations {
        let decl = builder.ir.get_decl(*decl_idx);
        let DeclKind::Class(class) = &decl.kind else {
            continue;
        };
        if class.kind != ClassKind::Interface {
            continue;
        }
        for member in &class.members {
            let member_decl = builder.ir.get_decl(*member);
            if let DeclKind::Function(function) = &member_decl.kind {
                if function.kind == FunctionKind::Method
                    && function.is_override
                    && function.body.is_some()
                    && any_methods.contains(&member_decl.name)
                {
                    diagnostics.push(Diagnostic {
                        kind: DiagnosticKind::AnyMethodImplementedInInterface {
                            method: member_decl.name.clone(),
                        },
                        span: member_decl.span,
                        path: module.file_path.clone(),
                    });
                }
            }
        }
    }
    diagnostics
}

/// The method names every class inherits from the universal base.
fn universal_base_methods(builder: &IrBuilder) -> HashSet<String> {
    builder
        .ir
        .expect_class(builder.ir.any_class)
        .members
        .iter()
        .filter_map(|idx| {
            let decl = builder.ir.get_decl(*idx);
            match &decl.kind {
                DeclKind::Function(f) if f.kind != FunctionKind::Constructor => {
                    Some(decl.name.clone())
                }
                _ => None,
            }
        })
        .collect()
}

/// Creates a report from a diagnostic.
pub fn diagnostic_to_report(diagnostic: &Diagnostic) -> Report<'static, FileSpan> {
    let mut colors = ColorGenerator::new();
    let path = diagnostic.path.display().to_string();
    let filespan = FileSpan::new(path, diagnostic.span.into());
    match &diagnostic.kind {
        DiagnosticKind::AnyMethodImplementedInInterface { method } => {
            Report::build(ReportKind::Warning, filespan.clone())
                .with_code("AnyMethodImplementedInInterface")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!(
                            "Method {method:?} is inherited from the universal base and must not have a body in an interface."
                        ))
                        .with_color(colors.next()),
                )
                .finish()
        }
    }
}

/// Creates a report from a lowering error.
pub fn lowering_error_to_report(error: LoweringError) -> Report<'static, FileSpan> {
    let mut colors = ColorGenerator::new();
    match error {
        LoweringError::UnresolvedName {
            span,
            name,
            container,
            path,
        } => {
            let path = path.display().to_string();
            let filespan = FileSpan::new(path, span.into());
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("UnresolvedName")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!("Failed to resolve {name:?} in {container:?}."))
                        .with_color(colors.next()),
                )
                .with_message("Unresolved name.")
                .finish()
        }
        LoweringError::UnrecognizedType { span, name, path } => {
            let path = path.display().to_string();
            let filespan = FileSpan::new(path, span.into());
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("UnrecognizedType")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!("Failed to find type {:?}", name))
                        .with_color(colors.next()),
                )
                .with_message(format!("Unresolved type {:?}.", name))
                .finish()
        }
        LoweringError::MemberNotLowered {
            span,
            name,
            script,
            path,
        } => {
            let path = path.display().to_string();
            let filespan = FileSpan::new(path, span.into());
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("MemberNotLowered")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!(
                            "Member {name:?} of script {script:?} produced no declaration."
                        ))
                        .with_color(colors.next()),
                )
                .finish()
        }
        LoweringError::ScriptRemained { span, name, path } => {
            let path = path.display().to_string();
            let filespan = FileSpan::new(path, span.into());
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("ScriptRemained")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!("Script {name:?} survived lowering."))
                        .with_color(colors.next()),
                )
                .finish()
        }
        LoweringError::UnexpectedDeclaration {
            name,
            expected,
            found,
        } => {
            let filespan = FileSpan::new(String::new(), 0..0);
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("UnexpectedDeclaration")
                .with_label(
                    Label::new(filespan)
                        .with_message(format!(
                            "Unexpected shape for {name:?}: expected {expected}, found {found}."
                        ))
                        .with_color(colors.next()),
                )
                .finish()
        }
        LoweringError::Internal(message) => {
            let filespan = FileSpan::new(String::new(), 0..0);
            Report::build(ReportKind::Error, filespan.clone())
                .with_code("InternalError")
                .with_label(
                    Label::new(filespan)
                        .with_message(message)
                        .with_color(colors.next()),
                )
                .finish()
        }
    }
}
