//! Purpose: Hold top-level CLI command dispatch for `livedoc`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command opens one session, runs, then closes it before returning.
//! Invariants: `watch` unsubscribes before the session closes.

use std::time::Duration;

use clap::CommandFactory;
use livedoc::api::{
    CollectionState, Fields, FileStore, LocalAuth, RecordState, Session, SessionConfig, User,
    fields_from_value,
};
use tokio::time::Instant;

use super::*;

type CliSession = Session<FileStore, LocalAuth>;

pub(super) fn dispatch_command(
    command: Command,
    options: GlobalOptions,
) -> Result<RunOutcome, Error> {
    if let Command::Completion { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::aot::generate(shell, &mut cmd, "livedoc", &mut io::stdout());
        return Ok(RunOutcome::ok());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(async move {
        let mut session = open_session(&options).await?;
        let result = run_command(&session, command).await;
        session.close();
        result
    })
}

async fn open_session(options: &GlobalOptions) -> Result<CliSession, Error> {
    let store = FileStore::open(&options.dir)?;
    let auth = match &options.identity {
        Identity::User(uid) => LocalAuth::with_user(User::new(uid.clone())),
        Identity::None | Identity::Anonymous => LocalAuth::new(),
    };
    let config = SessionConfig::new().with_overlap(options.overlap);
    let session = Session::open(store, auth, config).await?;
    if options.identity == Identity::Anonymous {
        session.auth().sign_in_anonymously().await?;
    }
    Ok(session)
}

async fn run_command(session: &CliSession, command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Get { collection, id } => {
            let doc = session.doc(&collection)?;
            doc.load(&id).await?;
            emit_json(record_json(&collection, &doc.state(), doc.is_creator())?);
            Ok(RunOutcome::ok())
        }
        Command::Find {
            collection,
            field,
            value,
        } => {
            let doc = session.doc(&collection)?;
            doc.find(&field, parse_loose_value(&value)).await?;
            emit_json(record_json(&collection, &doc.state(), doc.is_creator())?);
            Ok(RunOutcome::ok())
        }
        Command::List { collection, filter } => {
            let records = session.collection(&collection)?;
            match filter {
                Some(raw) => {
                    let (field, value) = parse_where(&raw)?;
                    records.find(&field, value).await?;
                }
                None => {
                    records.load().await?;
                }
            }
            emit_json(collection_json(&collection, &records.state()));
            Ok(RunOutcome::ok())
        }
        Command::Create { collection, data } => {
            let fields = fields_from_value(parse_json_arg(&data, "record data")?)?;
            let doc = session.doc(&collection)?;
            let id = doc.create(fields).await?;
            emit_json(json!({ "collection": collection, "id": id }));
            Ok(RunOutcome::ok())
        }
        Command::Update {
            collection,
            id,
            data,
        } => {
            let changes = fields_from_value(parse_json_arg(&data, "record changes")?)?;
            let doc = session.doc(&collection)?;
            doc.update(&id, changes).await?;
            emit_json(json!({ "collection": collection, "id": id, "updated": true }));
            Ok(RunOutcome::ok())
        }
        Command::Set {
            collection,
            id,
            data,
        } => {
            let fields = fields_from_value(parse_json_arg(&data, "record data")?)?;
            let doc = session.doc(&collection)?;
            doc.set(&id, fields).await?;
            emit_json(json!({ "collection": collection, "id": id, "set": true }));
            Ok(RunOutcome::ok())
        }
        Command::Remove { collection, id } => {
            let doc = session.doc(&collection)?;
            doc.remove(&id).await?;
            emit_json(json!({ "collection": collection, "id": id, "removed": true }));
            Ok(RunOutcome::ok())
        }
        Command::Watch {
            collection,
            id,
            max,
            timeout_ms,
        } => {
            watch_record(session, &collection, &id, max, timeout_ms).await?;
            Ok(RunOutcome::ok())
        }
        Command::Completion { .. } => Ok(RunOutcome::ok()),
    }
}

async fn watch_record(
    session: &CliSession,
    collection: &str,
    id: &str,
    max: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<(), Error> {
    if max == Some(0) {
        return Ok(());
    }
    let doc = session.doc(collection)?;
    let mut states = doc.subscribe();
    let handle = doc.sync(id).await?;
    let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

    let mut emitted = 0usize;
    let mut last: Option<(bool, Option<Fields>)> = None;
    loop {
        let state = states.borrow_and_update().clone();
        let snapshot = (state.exists, state.doc.clone());
        if !state.loading && state.doc.is_some() && last.as_ref() != Some(&snapshot) {
            let mut line = record_json(collection, &state, doc.is_creator())?;
            if let (Value::Object(map), Some(time)) = (&mut line, time_now()) {
                map.insert("time".to_string(), json!(time));
            }
            emit_json_line(&line);
            last = Some(snapshot);
            emitted += 1;
            if max.is_some_and(|max| emitted >= max) {
                break;
            }
        }

        let timeout = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = timeout => break,
            _ = tokio::signal::ctrl_c() => break,
        }
        if !handle.is_active() {
            break;
        }
    }

    handle.unsubscribe_and_wait().await;
    Ok(())
}

fn record_json(collection: &str, state: &RecordState, owned: bool) -> Result<Value, Error> {
    let mut value = serde_json::to_value(state).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode record state")
            .with_source(err)
    })?;
    if let Value::Object(map) = &mut value {
        map.insert("collection".to_string(), json!(collection));
        map.insert("owned".to_string(), json!(owned));
    }
    Ok(value)
}

fn collection_json(collection: &str, state: &CollectionState) -> Value {
    let records = state.docs.as_deref().unwrap_or(&[]);
    let docs: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut entry = Map::new();
            entry.insert("id".to_string(), json!(record.id));
            entry.insert("doc".to_string(), Value::Object(record.fields.clone()));
            Value::Object(entry)
        })
        .collect();
    json!({
        "collection": collection,
        "exists": state.exists,
        "count": docs.len(),
        "docs": docs,
    })
}
