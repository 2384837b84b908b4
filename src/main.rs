use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use memcore::{MemCore, MemCoreConfig, MemError};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Line-oriented MemQL shell over a local memory folder", long_about = None)]
struct Args {
    /// JSON config file; flags and environment variables override it
    #[clap(long)]
    config: Option<PathBuf>,

    /// Memory folder
    #[clap(long, env = "MEMCORE_PATH")]
    path: Option<PathBuf>,

    #[clap(long, env = "MEMCORE_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Random projection reduction factor for vector search
    #[clap(long, env = "MEMCORE_PROJECTION_LEVEL")]
    projection_level: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<MemCoreConfig, MemError> {
        let mut config = match &self.config {
            Some(path) => MemCoreConfig::load(path)?,
            None => MemCoreConfig::default(),
        };
        if let Some(path) = self.path {
            config.root = path;
        }
        if let Some(key) = self.encryption_key.filter(|k| !k.is_empty()) {
            config.encryption_key = Some(key);
        }
        if let Some(level) = self.projection_level {
            config.projection_level = Some(level);
        }
        Ok(config)
    }
}

enum ShellCommand<'a> {
    Help,
    Exit,
    Export,
    Get(&'a str),
    History(&'a str),
    Query(&'a str),
}

fn classify(line: &str) -> ShellCommand<'_> {
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let arg = rest.trim().trim_matches(|c: char| c == '\'' || c == '"');
    match verb.to_ascii_uppercase().as_str() {
        "HELP" => ShellCommand::Help,
        "EXIT" | "QUIT" => ShellCommand::Exit,
        "EXPORT" if arg.is_empty() => ShellCommand::Export,
        "GET" if !arg.is_empty() => ShellCommand::Get(arg),
        "HISTORY" if !arg.is_empty() => ShellCommand::History(arg),
        _ => ShellCommand::Query(line),
    }
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let core = match args.into_config().and_then(MemCore::open) {
        Ok(core) => core,
        Err(e) => {
            eprintln!("[\u{2717}] Could not open memory folder: {}", e);
            std::process::exit(1);
        }
    };

    print_banner(&core);
    if let Err(e) = run(&core) {
        eprintln!("[\u{2717}] {}", e);
        std::process::exit(1);
    }
}

fn run(core: &MemCore) -> io::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("memql> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let outcome = match classify(line) {
            ShellCommand::Help => {
                print_help();
                Ok(())
            }
            ShellCommand::Exit => break,
            ShellCommand::Export => core.export_all().and_then(|records| print_json(&records)),
            ShellCommand::Get(id) => match core.get_memory(id) {
                Ok(Some(record)) => print_json(&record),
                Ok(None) => Err(MemError::NotFound(id.to_string())),
                Err(e) => Err(e),
            },
            ShellCommand::History(id) => core.get_history(id).and_then(|mut entries| {
                entries.reverse();
                print_json(&entries)
            }),
            ShellCommand::Query(text) => core.memql_query(text).and_then(|hits| {
                print_json(&hits)?;
                println!("({} row{})", hits.len(), if hits.len() == 1 { "" } else { "s" });
                Ok(())
            }),
        };

        if let Err(e) = outcome {
            match e {
                MemError::InvalidQuery(_) => println!("[\u{2717} Syntax Error] {}", e),
                _ => println!("[\u{26a0}\u{fe0f} Error] {}", e),
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), MemError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_banner(core: &MemCore) {
    println!("\n==================================================");
    println!("   memcore shell v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================\n");
    println!("Folder: {} ({} records)", core.config().root.display(), core.len());
    println!("Type 'HELP' for supported commands or 'EXIT' to quit.\n");
}

fn print_help() {
    println!("\n--- Available Commands ---");
    println!("1. CREATE:  CREATE MEM (content=\"...\", tags=\"a b\", importance=0.7, source=\"...\", encrypted=false)");
    println!("2. SELECT:  SELECT [WHERE field op value] [ORDER BY field [DESC]] [LIMIT n]");
    println!("3. VECTOR:  SELECT VECTOR \"text\" [SCORE 0.5] (needs an embedder)");
    println!("4. UPDATE:  UPDATE SET field=value [, field=value] [WHERE field op value]");
    println!("5. DELETE:  DELETE * | DELETE WHERE field op value");
    println!("6. GET:     GET <id>");
    println!("7. HISTORY: HISTORY <id> (newest first)");
    println!("8. EXPORT:  EXPORT");
    println!("9. EXIT:    Quit\n");
}
