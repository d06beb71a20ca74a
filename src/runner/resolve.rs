use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::SupervisorError;
use crate::interpreter::{self, InterpreterResolver};
use crate::models::ExecutionType;
use crate::runner::Invocation;

/// Turn an execution description into a spawnable invocation.
///
/// A relative working directory is taken from the project directory;
/// relative programs and scripts from the working directory. Anything
/// missing is a configuration error and the command never runs.
pub fn build_invocation(
    execution: &ExecutionType,
    working_dir: Option<&Path>,
    env_vars: Option<&HashMap<String, String>>,
    project_dir: &Path,
    interpreter: &InterpreterResolver,
) -> Result<Invocation, SupervisorError> {
    let cwd = match working_dir {
        Some(dir) => project_dir.join(dir),
        None => project_dir.to_path_buf(),
    };
    if !cwd.is_dir() {
        return Err(SupervisorError::Configuration(format!(
            "Working directory does not exist: {}",
            cwd.display()
        )));
    }

    let (program, args) = match execution {
        ExecutionType::Program { program, args } => (resolve_program(program, &cwd)?, args.clone()),
        ExecutionType::Script { script, args } => {
            let script_path = cwd.join(script);
            if !script_path.is_file() {
                return Err(SupervisorError::Configuration(format!(
                    "Script not found: {}",
                    script_path.display()
                )));
            }
            let interpreter = interpreter.resolve()?;
            let mut full_args = vec![script_path.to_string_lossy().to_string()];
            full_args.extend(args.iter().cloned());
            (interpreter, full_args)
        }
    };

    let mut env: Vec<(String, String)> = env_vars
        .map(|vars| vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    env.sort();

    Ok(Invocation {
        program,
        args,
        working_dir: Some(cwd),
        env_vars: env,
    })
}

/// Resolve a program the way a shell would: paths must exist, bare names
/// come from PATH.
pub fn resolve_program(program: &str, base: &Path) -> Result<PathBuf, SupervisorError> {
    interpreter::locate(program, base).ok_or_else(|| {
        let path = Path::new(program);
        if path.components().count() > 1 || path.is_absolute() {
            SupervisorError::Configuration(format!(
                "Command not found: {}",
                base.join(path).display()
            ))
        } else {
            SupervisorError::Configuration(format!("Command '{}' not found on PATH", program))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver_for(dir: &Path, candidates: &[&str]) -> InterpreterResolver {
        InterpreterResolver::new(
            dir.to_path_buf(),
            candidates.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_script_uses_interpreter_and_prepends_script() {
        let tmp = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("venv/bin")).expect("mkdir");
        std::fs::write(tmp.path().join("venv/bin/python"), b"").expect("write");
        std::fs::create_dir_all(tmp.path().join("sync")).expect("mkdir");
        std::fs::write(tmp.path().join("sync/sync_deals_incremental.py"), b"").expect("write");

        let exec = ExecutionType::Script {
            script: "sync/sync_deals_incremental.py".to_string(),
            args: vec!["--since".to_string(), "2025-01-01".to_string()],
        };
        let resolver = resolver_for(tmp.path(), &["venv/bin/python"]);
        let inv = build_invocation(&exec, None, None, tmp.path(), &resolver).expect("build");

        assert_eq!(inv.program, tmp.path().join("venv/bin/python"));
        assert_eq!(
            inv.args[0],
            tmp.path()
                .join("sync/sync_deals_incremental.py")
                .to_string_lossy()
        );
        assert_eq!(&inv.args[1..], ["--since", "2025-01-01"]);
        assert_eq!(inv.working_dir.as_deref(), Some(tmp.path()));
    }

    #[test]
    fn test_missing_script_is_configuration_error() {
        let tmp = TempDir::new().expect("tempdir");
        let exec = ExecutionType::Script {
            script: "sync/missing.py".to_string(),
            args: vec![],
        };
        let resolver = resolver_for(tmp.path(), &["python3"]);
        match build_invocation(&exec, None, None, tmp.path(), &resolver).unwrap_err() {
            SupervisorError::Configuration(msg) => assert!(msg.contains("Script not found")),
            other => panic!("Expected Configuration, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_interpreter_is_configuration_error() {
        let tmp = TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("job.py"), b"").expect("write");
        let exec = ExecutionType::Script {
            script: "job.py".to_string(),
            args: vec![],
        };
        let resolver = resolver_for(tmp.path(), &["venv/bin/python"]);
        match build_invocation(&exec, None, None, tmp.path(), &resolver).unwrap_err() {
            SupervisorError::Configuration(msg) => assert!(msg.contains("No interpreter found")),
            other => panic!("Expected Configuration, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_program_path_is_configuration_error() {
        let tmp = TempDir::new().expect("tempdir");
        let exec = ExecutionType::Program {
            program: "/nonexistent/bin/sync".to_string(),
            args: vec![],
        };
        let resolver = resolver_for(tmp.path(), &[]);
        let err = build_invocation(&exec, None, None, tmp.path(), &resolver).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("/nonexistent/bin/sync"));
    }

    #[test]
    fn test_unknown_bare_program_mentions_path() {
        let err = resolve_program("no-such-sync-binary-xyz", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }

    #[test]
    fn test_missing_working_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let exec = ExecutionType::Program {
            program: "true".to_string(),
            args: vec![],
        };
        let resolver = resolver_for(tmp.path(), &[]);
        let err = build_invocation(
            &exec,
            Some(Path::new("does/not/exist")),
            None,
            tmp.path(),
            &resolver,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Working directory"));
    }

    #[test]
    fn test_env_vars_sorted() {
        let tmp = TempDir::new().expect("tempdir");
        let program = tmp.path().join("sync-bin");
        std::fs::write(&program, b"").expect("write");
        let exec = ExecutionType::Program {
            program: program.to_string_lossy().to_string(),
            args: vec![],
        };
        let mut vars = HashMap::new();
        vars.insert("ZOHO_BULK_IDS_CHUNK".to_string(), "40".to_string());
        vars.insert("DB_HOST".to_string(), "localhost".to_string());
        let resolver = resolver_for(tmp.path(), &[]);
        let inv = build_invocation(&exec, None, Some(&vars), tmp.path(), &resolver).expect("build");
        assert_eq!(inv.env_vars[0].0, "DB_HOST");
        assert_eq!(inv.env_vars[1].0, "ZOHO_BULK_IDS_CHUNK");
    }
}
