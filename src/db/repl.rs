//! Interactive REPL for running SQL against an engine.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::executor::ResultSet;
use crate::session::Session;

use super::engine::{Engine, EngineResult};

/// REPL configuration.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Prompt string.
    pub prompt: String,
    /// Max rows to display.
    pub max_rows: usize,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: "gitql> ".into(),
            max_rows: 1000,
        }
    }
}

/// The interactive REPL.
pub struct Repl {
    engine: Engine,
    session: Arc<Session>,
    config: ReplConfig,
}

impl Repl {
    pub fn new(engine: Engine) -> Self {
        let session = Arc::new(engine.session());
        Self {
            engine,
            session,
            config: ReplConfig::default(),
        }
    }

    pub fn with_config(engine: Engine, config: ReplConfig) -> Self {
        let session = Arc::new(engine.session());
        Self {
            engine,
            session,
            config,
        }
    }

    /// Run until EOF or an exit command.
    pub fn run(&mut self) -> io::Result<()> {
        println!(
            "gitql: {} repositories loaded. Type .help for help.",
            self.engine.pool().len()
        );

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut input = String::new();
        let mut multiline = false;

        loop {
            let prompt = if multiline { "    -> " } else { &self.config.prompt };
            print!("{}", prompt);
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                println!();
                break;
            }
            let line = line.trim_end();
            if line.is_empty() && !multiline {
                continue;
            }

            if multiline {
                input.push(' ');
            }
            input.push_str(line);

            // Dot-commands are single line; SQL continues to a semicolon.
            if !input.starts_with('.') && !input.ends_with(';') {
                multiline = true;
                continue;
            }
            multiline = false;

            let command = input.trim().to_string();
            input.clear();

            if command.starts_with('.') {
                match command.as_str() {
                    ".exit" | ".quit" => break,
                    ".tables" => self.execute("SHOW TABLES"),
                    ".help" => {
                        println!(".tables        list tables");
                        println!(".exit          leave the repl");
                        println!("Any other input is executed as SQL (end with ;).");
                    }
                    other => eprintln!("unknown command: {}", other),
                }
                continue;
            }

            self.execute(&command);
        }

        self.session.close();
        Ok(())
    }

    fn execute(&self, sql: &str) {
        match self.run_sql(sql) {
            Ok(result) => self.print_result(&result),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    fn run_sql(&self, sql: &str) -> EngineResult<ResultSet> {
        self.engine.query(&self.session, sql)
    }

    fn print_result(&self, result: &ResultSet) {
        if result.columns.is_empty() {
            println!("OK");
            return;
        }
        println!("{}", result.columns.join("\t"));
        for row in result.rows.iter().take(self.config.max_rows) {
            let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            println!("{}", values.join("\t"));
        }
        if result.len() > self.config.max_rows {
            println!("... ({} rows total)", result.len());
        } else {
            println!("({} rows)", result.len());
        }
    }
}
