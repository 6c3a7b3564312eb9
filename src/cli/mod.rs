//! BP-016: CLI subcommands — init, validate, compile, editables, hash.

use crate::core::compiler::{self, Compiled};
use crate::core::context::{CompileContext, LocalReader};
use crate::core::{digest, parser};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONTEXT_FILE: &str = "bpforge.toml";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new blueprint project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Load and compile modules without writing anything
    Validate {
        /// Module paths or glob patterns
        #[arg(default_value = "bpforge.yaml")]
        files: Vec<String>,
    },

    /// Compile a module into its wire document
    Compile {
        /// Path to the root module
        #[arg(short, long, default_value = "bpforge.yaml")]
        file: PathBuf,

        /// Compile context (default: bpforge.toml next to the module, if any)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the document here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Print the runtime-editable fields of a module
    Editables {
        /// Path to the root module
        #[arg(short, long, default_value = "bpforge.yaml")]
        file: PathBuf,

        /// Compile context
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print BLAKE3 digests of the source module and the compiled document
    Hash {
        /// Path to the root module
        #[arg(short, long, default_value = "bpforge.yaml")]
        file: PathBuf,

        /// Compile context
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { files } => cmd_validate(&files),
        Commands::Compile {
            file,
            config,
            output,
            pretty,
        } => cmd_compile(&file, config.as_deref(), output.as_deref(), pretty),
        Commands::Editables { file, config } => cmd_editables(&file, config.as_deref()),
        Commands::Hash { file, config } => cmd_hash(&file, config.as_deref()),
    }
}

const TEMPLATE_MODULE: &str = r#"version: "1.0"
kind: blueprint
name: my-app
description: Single-tier web application
params:
  env: DEV
services:
  Web:
    variables:
      ENV: "{{params.env}}"
      PORT: {value: 8080, type: int, runtime: true}
    actions:
      restart:
        - exec: {name: bounce, script: "systemctl restart web"}
packages:
  WebPkg:
    refs: {services: Web}
    actions:
      install:
        - exec: {name: install, script: "echo installing on port @@{PORT}@@"}
substrates:
  VM: {}
deployments:
  WebDep:
    refs: {packages: [WebPkg], substrate: VM}
profiles:
  Default:
    refs: {deployments: WebDep}
root:
  refs: {profiles: [Default]}
"#;

const TEMPLATE_CONTEXT: &str = r#"api_version = "3.0"
strict_macros = false

[lookups.project]
[lookups.account]
[lookups.environment]
[lookups.user]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let module_path = path.join("bpforge.yaml");
    let context_path = path.join(CONTEXT_FILE);
    for p in [&module_path, &context_path] {
        if p.exists() {
            return Err(format!("{} already exists", p.display()));
        }
    }
    std::fs::write(&module_path, TEMPLATE_MODULE)
        .map_err(|e| format!("cannot write {}: {}", module_path.display(), e))?;
    std::fs::write(&context_path, TEMPLATE_CONTEXT)
        .map_err(|e| format!("cannot write {}: {}", context_path.display(), e))?;

    println!("Initialized bpforge project at {}", path.display());
    println!("  Created: {}", module_path.display());
    println!("  Created: {}", context_path.display());
    Ok(())
}

/// Context for `file`: explicit `--config`, else a sibling bpforge.toml, else defaults.
fn load_context(file: &Path, config: Option<&Path>) -> Result<CompileContext, String> {
    if let Some(path) = config {
        return CompileContext::load(path).map_err(|e| e.to_string());
    }
    let sibling = file
        .parent()
        .map(|dir| dir.join(CONTEXT_FILE))
        .filter(|p| p.is_file());
    match sibling {
        Some(path) => {
            debug!(path = %path.display(), "using sibling context");
            CompileContext::load(&path).map_err(|e| e.to_string())
        }
        None => Ok(CompileContext::default()),
    }
}

fn compile_file(file: &Path, config: Option<&Path>) -> Result<Compiled, String> {
    let ctx = load_context(file, config)?;
    let graph = parser::load_module(file, &LocalReader).map_err(|e| e.to_string())?;
    let compiled = compiler::compile(graph, &ctx).map_err(|e| e.to_string())?;
    for w in &compiled.warnings {
        eprintln!("warning: {}", w);
    }
    Ok(compiled)
}

fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>, String> {
    let mut files = Vec::new();
    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)
            .map_err(|e| format!("bad pattern '{}': {}", pattern, e))?
            .filter_map(Result::ok)
            .collect();
        if matches.is_empty() {
            return Err(format!("no module matches '{}'", pattern));
        }
        files.extend(matches);
    }
    Ok(files)
}

fn cmd_validate(patterns: &[String]) -> Result<(), String> {
    let files = expand_patterns(patterns)?;
    let mut failed = 0usize;
    for file in &files {
        match compile_file(file, None) {
            Ok(compiled) => println!(
                "OK: {} ({} entities, {} editables)",
                file.display(),
                compiled.resolved.reachable().len(),
                compiled.editables.fields().count()
            ),
            Err(e) => {
                failed += 1;
                eprintln!("FAIL: {}: {}", file.display(), e);
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} of {} modules failed", failed, files.len()));
    }
    Ok(())
}

fn cmd_compile(
    file: &Path,
    config: Option<&Path>,
    output: Option<&Path>,
    pretty: bool,
) -> Result<(), String> {
    let compiled = compile_file(file, config)?;
    let json = compiled.to_json(pretty).map_err(|e| e.to_string())?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))
                .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn cmd_editables(file: &Path, config: Option<&Path>) -> Result<(), String> {
    let compiled = compile_file(file, config)?;
    let json = serde_json::to_string_pretty(&compiled.editables.to_value())
        .map_err(|e| format!("JSON error: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn cmd_hash(file: &Path, config: Option<&Path>) -> Result<(), String> {
    let source = digest::hash_file(file).map_err(|e| e.to_string())?;
    let compiled = compile_file(file, config)?;
    let payload = compiled.digest().map_err(|e| e.to_string())?;
    println!("source:  {}", source);
    println!("payload: {}", payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        dir
    }

    #[test]
    fn test_bp016_init() {
        let dir = init_dir();
        assert!(dir.path().join("bpforge.yaml").exists());
        assert!(dir.path().join("bpforge.toml").exists());
    }

    #[test]
    fn test_bp016_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bpforge.toml"), "").unwrap();
        assert!(cmd_init(dir.path()).unwrap_err().contains("already exists"));
        assert!(!dir.path().join("bpforge.yaml").exists());
    }

    #[test]
    fn test_bp016_template_compiles() {
        let dir = init_dir();
        let compiled = compile_file(&dir.path().join("bpforge.yaml"), None).unwrap();
        assert!(compiled.warnings.is_empty(), "{:?}", compiled.warnings);
        assert_eq!(compiled.document["metadata"]["name"], "my-app");
        assert_eq!(
            compiled.editables.paths().collect::<Vec<_>>(),
            vec!["spec.resources.service_definition_list[Web].variable_list[PORT].value"]
        );
    }

    #[test]
    fn test_bp016_validate_glob() {
        let dir = init_dir();
        let pattern = dir.path().join("*.yaml").display().to_string();
        cmd_validate(&[pattern]).unwrap();
    }

    #[test]
    fn test_bp016_validate_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.yaml").display().to_string();
        assert!(cmd_validate(&[pattern]).unwrap_err().contains("no module matches"));
    }

    #[test]
    fn test_bp016_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bad.yaml");
        std::fs::write(&file, "version: \"2.0\"\n").unwrap();
        let err = cmd_validate(&[file.display().to_string()]).unwrap_err();
        assert_eq!(err, "1 of 1 modules failed");
    }

    #[test]
    fn test_bp016_compile_to_file() {
        let dir = init_dir();
        let out = dir.path().join("out.json");
        cmd_compile(&dir.path().join("bpforge.yaml"), None, Some(&out), true).unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(doc["api_version"], "3.0");
    }

    #[test]
    fn test_bp016_sibling_context() {
        let dir = init_dir();
        std::fs::write(dir.path().join("bpforge.toml"), "strict_macros = true\n").unwrap();
        let ctx = load_context(&dir.path().join("bpforge.yaml"), None).unwrap();
        assert!(ctx.strict_macros);

        let other = tempfile::tempdir().unwrap();
        let ctx = load_context(&other.path().join("bpforge.yaml"), None).unwrap();
        assert_eq!(ctx, CompileContext::default());
    }

    #[test]
    fn test_bp016_explicit_context_missing() {
        let dir = init_dir();
        let missing = dir.path().join("nope.toml");
        let err = load_context(&dir.path().join("bpforge.yaml"), Some(&missing)).unwrap_err();
        assert!(err.contains("nope.toml"), "{}", err);
    }

    #[test]
    fn test_bp016_hash_and_editables() {
        let dir = init_dir();
        let file = dir.path().join("bpforge.yaml");
        cmd_hash(&file, None).unwrap();
        cmd_editables(&file, None).unwrap();
    }
}
