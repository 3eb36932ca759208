//! ExecutorRegistry - 名前付き executor の登録と解決
//!
//! `Command::Module { name, args }` は実行時に動的ロードせず、
//! 起動時に組み立てたこの registry から引く。
//!
//! - 二重登録はエラー
//! - `expect()` でグラフが要求する名前が揃っているかを起動時に検査（fail-fast）

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::domain::{Command, TaskGroup};

/// A resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Turns module arguments into a process invocation.
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&self, args: &[String]) -> Result<Invocation, RegistryError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("executor '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("executor '{0}' is not registered")]
    NotRegistered(String),

    #[error("missing executors: {0:?}. The graph uses them but they are not registered.")]
    MissingExecutors(Vec<String>),

    #[error("executor '{name}': {reason}")]
    BadArguments { name: String, reason: String },
}

/// `sh`: join the arguments into one bash command line.
struct ShellExecutor;

impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "sh"
    }

    fn prepare(&self, args: &[String]) -> Result<Invocation, RegistryError> {
        if args.is_empty() {
            return Err(RegistryError::BadArguments {
                name: self.name().to_string(),
                reason: "needs a command line".to_string(),
            });
        }
        Ok(Invocation {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), args.join(" ")],
        })
    }
}

/// `exec`: first argument is the program.
struct ExecExecutor;

impl Executor for ExecExecutor {
    fn name(&self) -> &str {
        "exec"
    }

    fn prepare(&self, args: &[String]) -> Result<Invocation, RegistryError> {
        let (program, rest) = args.split_first().ok_or_else(|| RegistryError::BadArguments {
            name: self.name().to_string(),
            reason: "needs a program".to_string(),
        })?;
        Ok(Invocation {
            program: program.clone(),
            args: rest.to_vec(),
        })
    }
}

#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `sh` and `exec` executors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for executor in [Arc::new(ShellExecutor) as Arc<dyn Executor>, Arc::new(ExecExecutor)] {
            let name = executor.name().to_string();
            registry.executors.insert(name, executor);
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) -> Result<(), RegistryError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Fail fast if any expected executor is absent.
    pub fn expect<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<(), RegistryError> {
        let mut missing: Vec<String> = names
            .into_iter()
            .filter(|n| !self.executors.contains_key(*n))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();
        Err(RegistryError::MissingExecutors(missing))
    }

    /// Resolve a command. `script_path` is where a `Script` body will be written.
    pub fn resolve(&self, command: &Command, script_path: &Path) -> Result<Invocation, RegistryError> {
        match command {
            Command::Exec { argv } => ExecExecutor.prepare(argv),
            Command::Script { .. } => Ok(Invocation {
                program: "bash".to_string(),
                args: vec![script_path.to_string_lossy().into_owned()],
            }),
            Command::Module { name, args } => self
                .get(name)
                .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?
                .prepare(args),
        }
    }
}

/// Module names referenced by not-yet-completed tasks.
pub fn required_modules(groups: &[TaskGroup]) -> BTreeSet<String> {
    groups
        .iter()
        .flat_map(|g| g.tasks.iter())
        .filter(|t| !t.completed)
        .filter_map(|t| match &t.command {
            Command::Module { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}
