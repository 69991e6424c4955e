//! Interactive route console
//! Line-oriented commands that inspect and mutate the live route table.

use crate::persistence::{self, LoadedRoutes, PersistError};
use crate::routes::{normalize_domain, RouteStore};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

pub const HELP: &str = "\
Available commands:
  list                 - List all routes
  add <domain> <port>  - Add or replace a route to localhost:<port>
  remove <domain>      - Remove a route
  save [path]          - Save routes to a file (default: the routes file)
  load [path]          - Replace routes with the contents of a file
  help                 - Show this help
  exit                 - Shut down the proxy and exit";

const PROMPT: &str = "> ";

/// Parsed console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Add { domain: String, port: String },
    Remove { domain: String },
    Save { path: Option<PathBuf> },
    Load { path: Option<PathBuf> },
    Help,
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("incorrect number of arguments, usage: {usage}")]
    Arity { usage: &'static str },

    #[error("unknown command '{0}', type 'help' for a list of commands")]
    Unknown(String),
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let args: Vec<&str> = words.collect();

        let command = match (name.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("list", []) => Command::List,
            ("list", _) => return Err(CommandError::Arity { usage: "list" }),
            ("add", [domain, port]) => Command::Add {
                domain: domain.to_string(),
                port: port.to_string(),
            },
            ("add", _) => {
                return Err(CommandError::Arity {
                    usage: "add <domain> <port>",
                })
            }
            ("remove", [domain]) => Command::Remove {
                domain: domain.to_string(),
            },
            ("remove", _) => {
                return Err(CommandError::Arity {
                    usage: "remove <domain>",
                })
            }
            ("save", []) => Command::Save { path: None },
            ("save", [path]) => Command::Save {
                path: Some(PathBuf::from(path)),
            },
            ("save", _) => return Err(CommandError::Arity { usage: "save [path]" }),
            ("load", []) => Command::Load { path: None },
            ("load", [path]) => Command::Load {
                path: Some(PathBuf::from(path)),
            },
            ("load", _) => return Err(CommandError::Arity { usage: "load [path]" }),
            ("help", _) => Command::Help,
            ("exit", _) => Command::Exit,
            _ => return Err(CommandError::Unknown(name.to_string())),
        };

        Ok(Some(command))
    }
}

/// What the loop does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Executes commands against the shared route store.
#[derive(Debug, Clone)]
pub struct Console {
    routes: Arc<RouteStore>,
    routes_file: PathBuf,
}

impl Console {
    /// `routes_file` is written after every add/remove and is the default for save/load.
    pub fn new<P: AsRef<Path>>(routes: Arc<RouteStore>, routes_file: P) -> Self {
        Self {
            routes,
            routes_file: routes_file.as_ref().to_path_buf(),
        }
    }

    pub fn routes_file(&self) -> &Path {
        &self.routes_file
    }

    /// Run one command, writing its output to `out`.
    ///
    /// File access runs on the blocking pool.
    pub async fn execute<W: Write>(&self, command: Command, out: &mut W) -> io::Result<Flow> {
        debug!("console command: {:?}", command);

        match command {
            Command::List => {
                let routes = self.routes.list();
                if routes.is_empty() {
                    writeln!(out, "No routes configured.")?;
                }
                for (domain, port) in routes {
                    writeln!(out, "Domain: {}, Port: {}", domain, port)?;
                }
            }
            Command::Add { domain, port } => match self.routes.put(&domain, &port) {
                Ok(route) => {
                    info!("Route added: {} -> {}", route.domain, route.target);
                    match self.persist().await {
                        Ok(()) => writeln!(
                            out,
                            "Added new route for domain: {} on port: {}",
                            route.domain, route.port
                        )?,
                        Err(e) => writeln!(
                            out,
                            "Added route for domain: {} on port: {}, but saving failed: {}",
                            route.domain, route.port, e
                        )?,
                    }
                }
                Err(e) => writeln!(out, "Error: {}", e)?,
            },
            Command::Remove { domain } => {
                if !self.routes.remove(&domain) {
                    writeln!(out, "Error: No such domain: {}", normalize_domain(&domain))?;
                } else {
                    let domain = normalize_domain(&domain);
                    info!("Route removed: {}", domain);
                    match self.persist().await {
                        Ok(()) => writeln!(out, "Removed route for domain: {}", domain)?,
                        Err(e) => writeln!(
                            out,
                            "Removed route for domain: {}, but saving failed: {}",
                            domain, e
                        )?,
                    }
                }
            }
            Command::Save { path } => {
                let path = path.unwrap_or_else(|| self.routes_file.clone());
                match self.save_to(path.clone()).await {
                    Ok(()) => writeln!(out, "Routes saved to: {}", path.display())?,
                    Err(e) => {
                        error!("Failed to save routes: {}", e);
                        writeln!(out, "Error: {}", e)?
                    }
                }
            }
            Command::Load { path } => {
                let path = path.unwrap_or_else(|| self.routes_file.clone());
                match load_from(path.clone()).await {
                    Ok(loaded) => {
                        let count = loaded.table.len();
                        self.routes.replace_all(loaded.table);
                        info!("Loaded {} route(s) from {}", count, path.display());
                        if loaded.skipped > 0 {
                            writeln!(
                                out,
                                "Routes loaded from: {} ({} invalid record(s) skipped)",
                                path.display(),
                                loaded.skipped
                            )?;
                        } else {
                            writeln!(out, "Routes loaded from: {}", path.display())?;
                        }
                    }
                    Err(PersistError::NotFound(path)) => {
                        writeln!(out, "Error: No such file: {}", path.display())?
                    }
                    Err(e) => writeln!(out, "Error: {}", e)?,
                }
            }
            Command::Help => writeln!(out, "{}", HELP)?,
            Command::Exit => {
                writeln!(out, "Shutting down...")?;
                return Ok(Flow::Exit);
            }
        }

        Ok(Flow::Continue)
    }

    /// Read commands from `lines` until `exit` or end of input.
    pub async fn run<W: Write>(
        &self,
        lines: &mut mpsc::Receiver<String>,
        out: &mut W,
    ) -> io::Result<()> {
        loop {
            write!(out, "{}", PROMPT)?;
            out.flush()?;

            let Some(line) = lines.recv().await else {
                writeln!(out)?;
                info!("Console input closed");
                return Ok(());
            };

            match Command::parse(&line) {
                Ok(Some(command)) => {
                    if self.execute(command, out).await? == Flow::Exit {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => writeln!(out, "Error: {}", e)?,
            }
        }
    }

    /// Save a snapshot of the table to the routes file.
    async fn persist(&self) -> Result<(), PersistError> {
        let result = self.save_to(self.routes_file.clone()).await;
        if let Err(e) = &result {
            error!("Failed to save routes: {}", e);
        }
        result
    }

    async fn save_to(&self, path: PathBuf) -> Result<(), PersistError> {
        let records = self.routes.records();
        let target = path.clone();
        tokio::task::spawn_blocking(move || persistence::save(&target, &records))
            .await
            .map_err(|e| PersistError::Write {
                path,
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
    }
}

async fn load_from(path: PathBuf) -> Result<LoadedRoutes, PersistError> {
    let source = path.clone();
    tokio::task::spawn_blocking(move || persistence::load(&source))
        .await
        .map_err(|e| PersistError::Read {
            path,
            source: io::Error::new(io::ErrorKind::Other, e),
        })?
}

/// Lines from stdin, read on a dedicated thread. The channel closes at end of input.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);

    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::RouteRecord;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn console(dir: &Path) -> Console {
        Console::new(Arc::new(RouteStore::new()), dir.join("routes.json"))
    }

    async fn exec(console: &Console, line: &str) -> String {
        let mut out = Vec::new();
        let command = Command::parse(line).unwrap().unwrap();
        console.execute(command, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("list"), Ok(Some(Command::List)));
        assert_eq!(
            Command::parse("  add example.com 9000 "),
            Ok(Some(Command::Add {
                domain: "example.com".to_string(),
                port: "9000".to_string()
            }))
        );
        assert_eq!(
            Command::parse("remove example.com"),
            Ok(Some(Command::Remove {
                domain: "example.com".to_string()
            }))
        );
        assert_eq!(Command::parse("save"), Ok(Some(Command::Save { path: None })));
        assert_eq!(
            Command::parse("load other.json"),
            Ok(Some(Command::Load {
                path: Some(PathBuf::from("other.json"))
            }))
        );
        assert_eq!(Command::parse("EXIT"), Ok(Some(Command::Exit)));
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Command::parse("add example.com"),
            Err(CommandError::Arity {
                usage: "add <domain> <port>"
            })
        );
        assert_eq!(
            Command::parse("remove"),
            Err(CommandError::Arity {
                usage: "remove <domain>"
            })
        );
        assert_eq!(
            Command::parse("save a b"),
            Err(CommandError::Arity { usage: "save [path]" })
        );
        assert_eq!(
            Command::parse("frobnicate"),
            Err(CommandError::Unknown("frobnicate".to_string()))
        );
    }

    #[tokio::test]
    async fn test_add_remove_leaves_empty_file() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());

        let out = exec(&console, "add example.com 9000").await;
        assert_eq!(out, "Added new route for domain: example.com on port: 9000\n");
        assert_eq!(
            persistence::load(console.routes_file()).unwrap().table.len(),
            1
        );

        let out = exec(&console, "remove www.example.com").await;
        assert_eq!(out, "Removed route for domain: example.com\n");

        assert_eq!(exec(&console, "list").await, "No routes configured.\n");
        let saved = std::fs::read_to_string(console.routes_file()).unwrap();
        assert_eq!(saved.trim(), "[]");
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        exec(&console, "add b.com 9001").await;
        exec(&console, "add WWW.A.com 9000").await;

        assert_eq!(
            exec(&console, "list").await,
            "Domain: a.com, Port: 9000\nDomain: b.com, Port: 9001\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_add_changes_nothing() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());

        let out = exec(&console, "add example.com notaport").await;
        assert!(out.starts_with("Error: invalid port"));
        assert!(console.routes.is_empty());
        assert!(!console.routes_file().exists());
    }

    #[tokio::test]
    async fn test_remove_unknown_domain() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());

        assert_eq!(
            exec(&console, "remove Nope.com").await,
            "Error: No such domain: nope.com\n"
        );
    }

    #[tokio::test]
    async fn test_save_and_load_other_path() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let other = dir.path().join("backup.json");

        exec(&console, "add a.com 9000").await;
        let out = exec(&console, &format!("save {}", other.display())).await;
        assert_eq!(out, format!("Routes saved to: {}\n", other.display()));

        exec(&console, "add b.com 9001").await;
        let out = exec(&console, &format!("load {}", other.display())).await;
        assert_eq!(out, format!("Routes loaded from: {}\n", other.display()));
        assert_eq!(console.routes.list(), vec![("a.com".to_string(), "9000".to_string())]);
    }

    #[tokio::test]
    async fn test_load_failures_keep_table() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        exec(&console, "add a.com 9000").await;

        let missing = dir.path().join("missing.json");
        assert_eq!(
            exec(&console, &format!("load {}", missing.display())).await,
            format!("Error: No such file: {}\n", missing.display())
        );

        let malformed = dir.path().join("bad.json");
        std::fs::write(&malformed, "{ not json").unwrap();
        let out = exec(&console, &format!("load {}", malformed.display())).await;
        assert!(out.starts_with("Error:"));

        assert_eq!(console.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_load_reports_skipped_records() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let records = vec![
            RouteRecord {
                domain: "a.com".to_string(),
                port: "9000".to_string(),
            },
            RouteRecord {
                domain: "b.com".to_string(),
                port: "abc".to_string(),
            },
        ];
        persistence::save(console.routes_file(), &records).unwrap();

        let out = exec(&console, "load").await;
        assert!(out.contains("1 invalid record(s) skipped"));
        assert!(console.routes.contains("a.com"));
        assert!(!console.routes.contains("b.com"));
    }

    #[tokio::test]
    async fn test_exit_flow() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let mut out = Vec::new();
        assert_eq!(console.execute(Command::Exit, &mut out).await.unwrap(), Flow::Exit);
        assert_eq!(
            console.execute(Command::Help, &mut out).await.unwrap(),
            Flow::Continue
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_writes_leave_runtime_free() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let other = tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });

        // On a single-threaded runtime the other task only runs if the save yields.
        exec(&console, "add a.com 9000").await;
        assert!(ran.load(Ordering::SeqCst), "route file was written on the runtime thread");
        other.await.unwrap();

        let out = exec(&console, "load").await;
        assert_eq!(out, format!("Routes loaded from: {}\n", console.routes_file().display()));
    }

    #[tokio::test]
    async fn test_run_until_exit() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let (tx, mut rx) = mpsc::channel(8);
        for line in ["add a.com 9000", "", "bogus", "add b.com", "exit", "add c.com 9002"] {
            tx.send(line.to_string()).await.unwrap();
        }

        let mut out = Vec::new();
        console.run(&mut rx, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Added new route for domain: a.com on port: 9000"));
        assert!(out.contains("Error: unknown command 'bogus'"));
        assert!(out.contains("usage: add <domain> <port>"));
        assert!(console.routes.contains("a.com"));
        assert!(!console.routes.contains("c.com"));
    }

    #[tokio::test]
    async fn test_run_ends_at_eof() {
        let dir = tempdir().unwrap();
        let console = console(dir.path());
        let (tx, mut rx) = mpsc::channel(8);
        tx.send("add a.com 9000".to_string()).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        console.run(&mut rx, &mut out).await.unwrap();
        assert!(console.routes.contains("a.com"));
    }
}
