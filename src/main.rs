use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use note_session::config::{self, SessionConfig};
use note_session::{
    init_tracing, EditField, Note, NoteStore, Services, SessionController, SqliteNoteStore,
    StaticAuthorizer, StaticPluginHost,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let db_path = config::database_path();
    let store = Arc::new(
        SqliteNoteStore::open(&db_path, false)
            .with_context(|| format!("Failed to open note database at {db_path}"))?,
    );
    let auth = Arc::new(StaticAuthorizer::new(true));
    let services = Services::new(store.clone(), Arc::new(StaticPluginHost::new()), auth.clone());
    let config = SessionConfig::from_env();

    let session = match std::env::args().nth(1) {
        Some(id) => {
            let Some(note) = store.get_note(&id).await? else {
                bail!("Note {id} not found in {db_path}");
            };
            SessionController::open(note, services, config).await
        }
        None => SessionController::open_template(Note::template(), services, config).await,
    };
    print_snapshot(&session)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg),
            None => (line.trim(), ""),
        };
        let result = match command {
            "title" => session.edit(EditField::Title, arg).await,
            "body" => session.edit(EditField::Body, arg.replace("\\n", "\n")).await,
            "lock" => session.toggle_lock().await,
            "trash" => session.request_delete(false).await,
            "delete" => session.request_delete(true).await,
            "unlock-protected" => session.dismiss_protection_overlay().await,
            // Delivered through the authorizer's event stream; `show` reflects it.
            "protection-session-begin" => {
                auth.begin_unprotected_session();
                Ok(())
            }
            "protection-session-end" => {
                auth.expire_unprotected_session();
                Ok(())
            }
            "show" => Ok(()),
            "quit" => break,
            "" => continue,
            other => {
                eprintln!("unknown command: {other}");
                continue;
            }
        };
        if let Err(e) = result {
            eprintln!("error: {e}");
        }
        print_snapshot(&session)?;
    }

    session.close().await;
    print_snapshot(&session)?;
    Ok(())
}

fn print_snapshot(session: &SessionController) -> Result<()> {
    println!("{}", serde_json::to_string(&session.snapshot())?);
    Ok(())
}
