//! Lumen Script -- discovery, reflection, and compilation of gameplay
//! component scripts.
//!
//! Component scripts are written in the Lumen component schema language
//! (`.lum` files): typed class declarations whose fields carry decorations
//! such as `@serialize`, with method bodies written as WebAssembly text.
//! This crate turns a set of such files into a WebAssembly module the host
//! can instantiate.
//!
//! # Pipeline
//!
//! 1. **Pass 1 (reflection):** every user script is parsed and resolved, and
//!    the [`MetadataExtractor`] walks the symbol table to fill a
//!    [`ScriptRegistry`] with one [`ScriptDescriptor`] per component file.
//! 2. **Code generation:** [`codegen::generate_entry`] turns the registry
//!    into a bridging entry file (scene object helpers, component factories,
//!    field offset constants, lifecycle entry points).
//! 3. **Pass 2 (emit):** the entry and everything it imports is lowered to
//!    WebAssembly text, assembled, and validated.
//!
//! [`compile_scripts`] drives the whole pipeline.
//!
//! # Example
//!
//! ```
//! use lumen_script::{compile_scripts, VirtualFileMap};
//!
//! let mut files = VirtualFileMap::new();
//! files.insert(
//!     "scripts/spinner.lum",
//!     r#"
//!     import { Component } from "~lib/runtime";
//!     export class Spinner extends Component {
//!         @serialize xrot: i16 = 3;
//!     }
//!     "#,
//! );
//!
//! let compiled = compile_scripts(&files).unwrap();
//! assert_eq!(compiled.registry.len(), 1);
//! assert!(compiled.has_export("add_component_Spinner"));
//! assert!(compiled.has_export("get_offset_Spinner_xrot"));
//! ```

#![deny(unsafe_code)]

pub mod codegen;
pub mod compiler;
pub mod extract;
mod lower;
pub mod program;
pub mod registry;
pub mod runtime;
pub mod syntax;

pub use compiler::{compile_scripts, CompileOutput, CompiledScripts, Compiler, VirtualFileMap};
pub use extract::{CompileTransform, MetadataExtractor};
pub use registry::{
    FieldDeclaration, InitialValue, RegistrySnapshot, ScriptDescriptor, ScriptRegistry,
};

/// The only schema version this compiler understands.
pub const SCHEMA_VERSION: u32 = 1;

/// File extension of component script sources.
pub const SCRIPT_EXTENSION: &str = "lum";

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// A compiler message anchored to a source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Virtual path of the file the message refers to.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn new(file: &str, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            file: file.to_owned(),
            line,
            column,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.file, self.line, self.column, self.message
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while discovering, reflecting, or compiling scripts.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The source text could not be parsed.
    #[error("syntax error: {0}")]
    Syntax(Diagnostic),

    /// The source parsed but is not a valid program (unresolved import,
    /// unknown class in a macro, bad initializer, duplicate class, ...).
    #[error("semantic error: {0}")]
    Semantic(Diagnostic),

    /// An import names a file that is not in the virtual file map.
    #[error("file '{path}' imported by '{imported_by}' is not in the virtual file map")]
    MissingFile {
        /// Resolved virtual path that was looked up.
        path: String,
        /// The importing file.
        imported_by: String,
    },

    /// The file declares a schema version this compiler does not support.
    #[error("{file}: unsupported schema version {found} (supported: {supported})", supported = SCHEMA_VERSION)]
    UnsupportedSchema {
        file: String,
        found: u32,
    },

    /// A registry entry was added without a class name.
    #[error("script '{file_identity}' has no class name -- every descriptor needs the class it was extracted from")]
    MissingClassName {
        file_identity: String,
    },

    /// Lowered WebAssembly text failed to assemble or validate.
    #[error("bytecode assembly failed: {0}")]
    Assembly(String),
}

impl ScriptError {
    /// The file this error is attributed to, when there is one.
    pub fn file(&self) -> Option<&str> {
        match self {
            ScriptError::Syntax(d) | ScriptError::Semantic(d) => Some(&d.file),
            ScriptError::MissingFile { imported_by, .. } => Some(imported_by),
            ScriptError::UnsupportedSchema { file, .. } => Some(file),
            ScriptError::MissingClassName { file_identity } => Some(file_identity),
            ScriptError::Assembly(_) => None,
        }
    }
}
