//! Purpose: `livedoc` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Results are JSON on stdout; errors are JSON on stderr unless stderr is a tty.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All reads and writes go through a `Session` over a `FileStore`.
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use livedoc::api::{Error, ErrorKind, OverlapPolicy, to_exit_code};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `livedoc --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let options = GlobalOptions {
        dir: cli.dir.unwrap_or_else(default_store_dir),
        identity: Identity::from_flags(cli.as_uid, cli.anonymous),
        overlap: cli.overlap.into(),
    };

    command_dispatch::dispatch_command(cli.command, options)
        .map_err(add_unauthenticated_hint)
        .map_err(add_corrupt_hint)
        .map_err(|err| (err, color_mode))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "livedoc",
    version,
    about = "Read, write, and watch records in a local document store",
    long_about = r#"Read, write, and watch records in a local document store.

Each collection is a JSON file under --dir. Writes are stamped with
createdAt/createdBy and updatedAt/updatedBy for the acting identity."#,
    after_help = r#"EXAMPLES
  $ livedoc --as alice create posts '{"title": "hello", "slug": "hello"}'
  $ livedoc --as alice get posts <id>
  $ livedoc find posts slug '"hello"'
  $ livedoc list posts --where 'createdBy="alice"'
  $ livedoc watch posts <id> --max 3

NOTES
  - Default location: ~/.livedoc/stores (override with --dir)
  - Writes other than remove need --as <uid> or --anonymous"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Store directory (default: ~/.livedoc/stores)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long = "as",
        global = true,
        value_name = "UID",
        conflicts_with = "anonymous",
        help = "Act as the signed-in user UID"
    )]
    as_uid: Option<String>,
    #[arg(long, global = true, help = "Sign in anonymously with a fresh uid")]
    anonymous: bool,
    #[arg(
        long,
        global = true,
        default_value = "latest-call",
        value_enum,
        help = "Which of two overlapping acquisitions wins: latest-call|last-resolved"
    )]
    overlap: OverlapCli,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OverlapCli {
    LatestCall,
    LastResolved,
}

impl From<OverlapCli> for OverlapPolicy {
    fn from(value: OverlapCli) -> Self {
        match value {
            OverlapCli::LatestCall => OverlapPolicy::LatestCall,
            OverlapCli::LastResolved => OverlapPolicy::LastResolved,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Identity {
    None,
    User(String),
    Anonymous,
}

impl Identity {
    fn from_flags(as_uid: Option<String>, anonymous: bool) -> Self {
        match (as_uid, anonymous) {
            (Some(uid), _) => Identity::User(uid),
            (None, true) => Identity::Anonymous,
            (None, false) => Identity::None,
        }
    }
}

struct GlobalOptions {
    dir: PathBuf,
    identity: Identity,
    overlap: OverlapPolicy,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Load one record by id",
        after_help = r#"EXAMPLES
  $ livedoc get posts 3XbT9qk2mZ
  $ livedoc --as alice get posts 3XbT9qk2mZ   # "owned" reflects alice"#
    )]
    Get {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record id")]
        id: String,
    },
    #[command(
        about = "Load the first record whose field equals a value",
        after_help = r#"EXAMPLES
  $ livedoc find posts slug '"hello"'
  $ livedoc find posts slug hello          # bare words are strings
  $ livedoc find scores points 42"#
    )]
    Find {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Field to match")]
        field: String,
        #[arg(help = "Value to match (JSON, or a bare string)")]
        value: String,
    },
    #[command(
        about = "Load every record of a collection",
        after_help = r#"EXAMPLES
  $ livedoc list posts
  $ livedoc list posts --where 'createdBy="alice"'"#
    )]
    List {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(
            long = "where",
            value_name = "FIELD=VALUE",
            help = "Keep records whose FIELD equals VALUE (JSON, or a bare string)"
        )]
        filter: Option<String>,
    },
    #[command(
        about = "Create a record with a generated id",
        after_help = r#"EXAMPLES
  $ livedoc --as alice create posts '{"title": "hello"}'"#
    )]
    Create {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record fields as a JSON object")]
        data: String,
    },
    #[command(about = "Merge fields into an existing record")]
    Update {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record id")]
        id: String,
        #[arg(help = "Changed fields as a JSON object")]
        data: String,
    },
    #[command(about = "Replace a record wholesale, creating it if needed")]
    Set {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record id")]
        id: String,
        #[arg(help = "Record fields as a JSON object")]
        data: String,
    },
    #[command(about = "Delete a record (no-op when it is already gone)")]
    Remove {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record id")]
        id: String,
    },
    #[command(
        about = "Stream a record's state as JSON Lines while it changes",
        after_help = r#"EXAMPLES
  $ livedoc watch posts 3XbT9qk2mZ
  $ livedoc watch posts 3XbT9qk2mZ --max 2 --timeout-ms 5000

NOTES
  - One line per observed snapshot, each with an RFC 3339 "time"
  - Stops on Ctrl-C, after --max lines, or after --timeout-ms"#
    )]
    Watch {
        #[arg(help = "Collection name")]
        collection: String,
        #[arg(help = "Record id")]
        id: String,
        #[arg(long, help = "Stop after emitting N lines")]
        max: Option<usize>,
        #[arg(long = "timeout-ms", value_name = "MS", help = "Stop after MS milliseconds")]
        timeout_ms: Option<u64>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ livedoc completion bash > ~/.local/share/bash-completion/completions/livedoc
  $ livedoc completion zsh > ~/.zfunc/_livedoc
  $ livedoc completion fish > ~/.config/fish/completions/livedoc.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn default_store_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".livedoc").join("stores")
}

/// Parses a CLI value as JSON, falling back to a plain string.
fn parse_loose_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_json_arg(raw: &str, what: &str) -> Result<Value, Error> {
    serde_json::from_str(raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what} is not valid JSON"))
            .with_hint("Quote the object for your shell, e.g. '{\"title\": \"hello\"}'.")
            .with_source(err)
    })
}

fn parse_where(raw: &str) -> Result<(String, Value), Error> {
    match raw.split_once('=') {
        Some((field, value)) if !field.is_empty() => {
            Ok((field.to_string(), parse_loose_value(value)))
        }
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid --where expression: {raw}"))
            .with_hint("Use FIELD=VALUE, e.g. --where 'createdBy=\"alice\"'.")),
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_json_line(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn time_now() -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn add_unauthenticated_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Unauthenticated {
        return err;
    }
    err.with_hint("Pass --as <uid> or --anonymous to act as a signed-in user.")
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("The collection file is not a JSON object of records; restore or remove it.")
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyExists => "already exists".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Unauthenticated => "not signed in".to_string(),
        ErrorKind::Unavailable => "store unavailable".to_string(),
        ErrorKind::Unsupported => "unsupported operation".to_string(),
        ErrorKind::Closed => "session closed".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(collection) = err.collection() {
        inner.insert("collection".to_string(), json!(collection));
    }
    if let Some(id) = err.id() {
        inner.insert("id".to_string(), json!(id));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        Cli, Error, ErrorKind, Identity, add_unauthenticated_hint, error_json, error_text,
        parse_loose_value, parse_where,
    };
    use clap::Parser;
    use serde_json::json;

    #[test]
    fn loose_values_fall_back_to_strings() {
        assert_eq!(parse_loose_value("42"), json!(42));
        assert_eq!(parse_loose_value("\"hello\""), json!("hello"));
        assert_eq!(parse_loose_value("hello"), json!("hello"));
        assert_eq!(parse_loose_value("true"), json!(true));
    }

    #[test]
    fn where_expression_splits_on_first_equals() {
        let (field, value) = parse_where("title=a=b").expect("parse");
        assert_eq!(field, "title");
        assert_eq!(value, json!("a=b"));

        let err = parse_where("=1").expect_err("empty field");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = parse_where("title").expect_err("missing equals");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn identity_flags_resolve() {
        assert_eq!(
            Identity::from_flags(Some("u1".to_string()), false),
            Identity::User("u1".to_string())
        );
        assert_eq!(Identity::from_flags(None, true), Identity::Anonymous);
        assert_eq!(Identity::from_flags(None, false), Identity::None);
    }

    #[test]
    fn as_and_anonymous_conflict() {
        let parsed = Cli::try_parse_from(["livedoc", "--as", "u1", "--anonymous", "get", "c", "a"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn error_json_carries_kind_message_and_hint() {
        let err = add_unauthenticated_hint(
            Error::new(ErrorKind::Unauthenticated)
                .with_message("sign in before writing")
                .with_collection("posts"),
        );
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], json!("Unauthenticated"));
        assert_eq!(value["error"]["message"], json!("sign in before writing"));
        assert_eq!(value["error"]["collection"], json!("posts"));
        assert!(value["error"]["hint"].as_str().is_some());
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::NotFound).with_hint("check the id");
        let plain = error_text(&err, false);
        assert!(plain.starts_with("error: not found"));
        assert!(plain.contains("hint: check the id"));
        assert!(!plain.contains('\u{1b}'));

        let colored = error_text(&err, true);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m"));
    }
}
