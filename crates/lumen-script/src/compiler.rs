//! Compiler invocation and the two-pass script pipeline.

use std::collections::{BTreeMap, VecDeque};

use crate::codegen::{self, ENTRY_PATH, EXTRACTION_ENTRY_PATH};
use crate::extract::{CompileTransform, MetadataExtractor};
use crate::lower;
use crate::program::Program;
use crate::registry::ScriptRegistry;
use crate::runtime::{RUNTIME_PATH, RUNTIME_SOURCE};
use crate::syntax::{self, SourceFile};
use crate::{ScriptError, SCRIPT_EXTENSION};

// ---------------------------------------------------------------------------
// VirtualFileMap
// ---------------------------------------------------------------------------

/// Ordered map of virtual path to source text, as produced by the resource
/// loader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualFileMap {
    files: BTreeMap<String, String>,
}

impl VirtualFileMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file, returning the previous source.
    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) -> Option<String> {
        self.files.insert(path.into(), source.into())
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.files.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, s)| (p.as_str(), s.as_str()))
    }

    /// User script paths: files with the script extension outside the
    /// reserved `~` namespace.
    pub fn script_paths(&self) -> impl Iterator<Item = &str> {
        let suffix = format!(".{SCRIPT_EXTENSION}");
        self.files
            .keys()
            .filter(move |p| p.ends_with(&suffix) && !p.starts_with('~'))
            .map(String::as_str)
    }
}

impl<P: Into<String>, S: Into<String>> FromIterator<(P, S)> for VirtualFileMap {
    fn from_iter<I: IntoIterator<Item = (P, S)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (path, source) in iter {
            map.insert(path, source);
        }
        map
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Result of one compiler invocation.
#[derive(Debug)]
pub struct CompileOutput {
    /// Every loaded file, runtime library first.
    pub program: Program,
    /// Lowered WebAssembly text; `None` for reflection-only runs.
    pub text: Option<String>,
    /// Assembled and validated module; `None` for reflection-only runs.
    pub bytecode: Option<Vec<u8>>,
    /// Export names of the module, in export section order.
    pub exports: Vec<String>,
}

/// One compiler invocation over a [`VirtualFileMap`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Compiler {
    reflection_only: bool,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after the transform hook. Files that fail to load are logged
    /// and skipped instead of failing the run.
    pub fn reflection_only(mut self, enabled: bool) -> Self {
        self.reflection_only = enabled;
        self
    }

    /// Compile `entry` (a `(path, source)` pair that is not part of `files`)
    /// and everything it imports.
    ///
    /// # Errors
    ///
    /// Any [`ScriptError`] from loading, the transform, lowering or
    /// assembly. In reflection-only mode, per-file load failures are not
    /// errors.
    pub fn compile(
        &self,
        files: &VirtualFileMap,
        entry: (&str, &str),
        transform: Option<&mut dyn CompileTransform>,
    ) -> Result<CompileOutput, ScriptError> {
        let program = self.load(files, entry)?;
        tracing::debug!(
            entry = entry.0,
            files = program.files().len(),
            reflection_only = self.reflection_only,
            "program loaded"
        );

        if !self.reflection_only {
            check_imports(&program)?;
        }
        if let Some(transform) = transform {
            transform.after_resolve(&program)?;
        }
        if self.reflection_only {
            return Ok(CompileOutput {
                program,
                text: None,
                bytecode: None,
                exports: Vec::new(),
            });
        }

        let lowered = lower::lower(&program)?;
        tracing::debug!(
            heap_base = lowered.heap_base,
            callbacks = lowered.callback_count,
            text_len = lowered.text.len(),
            "program lowered"
        );
        let bytecode = assemble(&lowered.text)?;
        let exports = export_names(&bytecode)?;

        Ok(CompileOutput {
            program,
            text: Some(lowered.text),
            bytecode: Some(bytecode),
            exports,
        })
    }

    /// Runtime library first, then the entry, then imports breadth-first.
    fn load(&self, files: &VirtualFileMap, entry: (&str, &str)) -> Result<Program, ScriptError> {
        let mut program = Program::new();
        program.add(syntax::parse(RUNTIME_PATH, RUNTIME_SOURCE)?);

        let mut queue = VecDeque::new();
        let entry_file = syntax::parse(entry.0, entry.1)?;
        queue.extend(imports_of(&entry_file));
        program.add(entry_file);

        while let Some((path, imported_by)) = queue.pop_front() {
            if program.contains(&path) {
                continue;
            }
            let Some(source) = files.get(&path) else {
                let err = ScriptError::MissingFile { path, imported_by };
                if self.reflection_only {
                    tracing::warn!(error = %err, "skipping missing script");
                    continue;
                }
                return Err(err);
            };
            match syntax::parse(&path, source) {
                Ok(file) => {
                    queue.extend(imports_of(&file));
                    program.add(file);
                }
                Err(err) if self.reflection_only => {
                    tracing::warn!(file = %path, error = %err, "skipping script that failed to parse");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(program)
    }
}

fn imports_of(file: &SourceFile) -> Vec<(String, String)> {
    file.imports()
        .map(|import| (import.path(), file.path.clone()))
        .collect()
}

/// Every named import must refer to an exported class of the target file.
fn check_imports(program: &Program) -> Result<(), ScriptError> {
    for (index, file) in program.files().iter().enumerate() {
        for import in file.imports() {
            let path = import.path();
            let Some(target) = program.file_index(&path) else {
                continue;
            };
            for name in &import.names {
                let found = program.resolve_class(target, name);
                if !found.is_some_and(|c| program.class(c).exported) {
                    return Err(program.semantic(
                        index,
                        import.span.line,
                        import.span.column,
                        format!("`{name}` is not an exported class of {path}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn assemble(text: &str) -> Result<Vec<u8>, ScriptError> {
    let bytecode = wat::parse_str(text).map_err(|e| ScriptError::Assembly(e.to_string()))?;
    wasmparser::validate(&bytecode).map_err(|e| ScriptError::Assembly(e.to_string()))?;
    Ok(bytecode)
}

fn export_names(bytecode: &[u8]) -> Result<Vec<String>, ScriptError> {
    let mut names = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(bytecode) {
        let payload = payload.map_err(|e| ScriptError::Assembly(e.to_string()))?;
        if let wasmparser::Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| ScriptError::Assembly(e.to_string()))?;
                names.push(export.name.to_owned());
            }
        }
    }
    Ok(names)
}

// ---------------------------------------------------------------------------
// Two-pass pipeline
// ---------------------------------------------------------------------------

/// Output of [`compile_scripts`].
#[derive(Debug, Clone)]
pub struct CompiledScripts {
    /// Component metadata extracted in pass 1.
    pub registry: ScriptRegistry,
    /// Generated pass-2 entry source.
    pub entry_source: String,
    /// Lowered WebAssembly text of the whole module.
    pub text: String,
    /// Binary module.
    pub bytecode: Vec<u8>,
    pub exports: Vec<String>,
    /// blake3 hash of `bytecode`, hex encoded.
    pub fingerprint: String,
}

impl CompiledScripts {
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }
}

/// Run the full pipeline: reflect over every script, generate the entry,
/// and compile it.
///
/// # Errors
///
/// Pass-2 failures. Pass-1 failures of individual files only drop those
/// files from the registry.
pub fn compile_scripts(files: &VirtualFileMap) -> Result<CompiledScripts, ScriptError> {
    let extraction_entry = codegen::generate_extraction_entry(files.script_paths());
    let mut extractor = MetadataExtractor::new();
    Compiler::new().reflection_only(true).compile(
        files,
        (EXTRACTION_ENTRY_PATH, &extraction_entry),
        Some(&mut extractor),
    )?;
    let registry = extractor.into_registry();

    let entry_source = codegen::generate_entry(&registry);
    let output = Compiler::new().compile(files, (ENTRY_PATH, &entry_source), None)?;

    let (Some(text), Some(bytecode)) = (output.text, output.bytecode) else {
        return Err(ScriptError::Assembly(
            "compiler produced no module".to_owned(),
        ));
    };
    let fingerprint = blake3::hash(&bytecode).to_hex().to_string();
    tracing::info!(
        components = registry.len(),
        bytes = bytecode.len(),
        fingerprint = %fingerprint,
        "scripts compiled"
    );

    Ok(CompiledScripts {
        registry,
        entry_source,
        text,
        bytecode,
        exports: output.exports,
        fingerprint,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SPINNER: &str = r#"
        import { Component } from "~lib/runtime";
        export class Spinner extends Component {
            @serialize xrot: i16 = 3;
            fn Update {
                (i32.store16 offset=@offsetof(xrot) (local.get $this)
                  (i32.add (i32.load16_s offset=@offsetof(xrot) (local.get $this)) (i32.const 1)))
            }
        }
    "#;

    #[test]
    fn script_paths_skip_reserved_and_foreign_files() {
        let files: VirtualFileMap = [
            ("scripts/a.lum", ""),
            ("~lib/other.lum", ""),
            ("textures/a.png", ""),
        ]
        .into_iter()
        .collect();
        let paths: Vec<_> = files.script_paths().collect();
        assert_eq!(paths, ["scripts/a.lum"]);
    }

    #[test]
    fn compiles_one_component() {
        let files: VirtualFileMap = [("scripts/spinner.lum", SPINNER)].into_iter().collect();
        let compiled = compile_scripts(&files).unwrap();

        assert_eq!(compiled.registry.len(), 1);
        assert!(compiled.has_export("add_component_Spinner"));
        assert!(compiled.has_export("get_offset_Spinner_xrot"));
        assert!(compiled.has_export("memory"));
        assert!(compiled.has_export("table"));
        assert!(compiled.has_export("__callbackCount"));
        assert_eq!(compiled.fingerprint.len(), 64);
    }

    #[test]
    fn recompiling_unchanged_sources_is_identical() {
        let files: VirtualFileMap = [("scripts/spinner.lum", SPINNER)].into_iter().collect();
        let a = compile_scripts(&files).unwrap();
        let b = compile_scripts(&files).unwrap();
        assert_eq!(a.entry_source, b.entry_source);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn broken_unreferenced_file_is_skipped() {
        let files: VirtualFileMap = [
            ("scripts/spinner.lum", SPINNER),
            ("scripts/broken.lum", "export class {"),
        ]
        .into_iter()
        .collect();
        let compiled = compile_scripts(&files).unwrap();
        assert_eq!(compiled.registry.len(), 1);
    }

    #[test]
    fn missing_import_fails_full_compile() {
        let files = VirtualFileMap::new();
        let err = Compiler::new()
            .compile(&files, ("~entry.lum", "import \"scripts/gone\";"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            ScriptError::MissingFile { ref path, ref imported_by }
                if path == "scripts/gone.lum" && imported_by == "~entry.lum"
        ));
    }

    #[test]
    fn missing_import_is_skipped_in_reflection_mode() {
        let files = VirtualFileMap::new();
        let output = Compiler::new()
            .reflection_only(true)
            .compile(&files, ("~entry.lum", "import \"scripts/gone\";"), None)
            .unwrap();
        assert!(output.bytecode.is_none());
        assert_eq!(output.program.files().len(), 2);
    }

    #[test]
    fn named_import_of_unexported_class_is_rejected() {
        let files: VirtualFileMap = [("scripts/a.lum", "class Hidden {}")].into_iter().collect();
        let err = Compiler::new()
            .compile(&files, ("~entry.lum", "import { Hidden } from \"scripts/a\";"), None)
            .unwrap_err();
        assert!(err.to_string().contains("`Hidden` is not an exported class"), "{err}");
    }

    #[test]
    fn semantic_errors_carry_location() {
        let files: VirtualFileMap = [(
            "scripts/bad.lum",
            "import { Component } from \"~lib/runtime\";\nexport class Bad extends Component {\n  @serialize n: i32 = true;\n}",
        )]
        .into_iter()
        .collect();
        let err = compile_scripts(&files).unwrap_err();
        assert_eq!(err.file(), Some("scripts/bad.lum"));
        assert!(err.to_string().contains("scripts/bad.lum:3:3"), "{err}");
    }
}
