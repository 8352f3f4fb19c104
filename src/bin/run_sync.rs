use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use rusqlite::Connection;

use sqlite_batch::SqliteDatabase;
use sync_engine::{ReqwestTransport, SyncEngine};

#[tokio::main]
async fn main() {
  env_logger::init();

  let cmd = Command::new("run-sync")
    .version("1.0")
    .arg(Arg::new("pull-url").required(true).short('u').long("pull-url"))
    .arg(Arg::new("database").required(true).short('d').long("database"))
    .arg(Arg::new("token").short('t').long("token"));

  let mut matches = cmd.get_matches();
  let pull_url = matches.remove_one::<String>("pull-url").unwrap();
  let database_path = matches.remove_one::<String>("database").unwrap();
  let token = matches.remove_one::<String>("token");

  let conn = Connection::open(&database_path).expect("failed to open sqlite database");
  let db = Arc::new(SqliteDatabase::new(conn));
  let transport = Arc::new(ReqwestTransport::new());
  let engine = SyncEngine::new(db, transport);

  let payload = serde_json::json!({ "pullEndpointUrl": pull_url, "connectionTag": 1 }).to_string();
  engine.configure(&payload).await.expect("invalid sync configuration");

  if let Some(token) = token {
    engine.set_auth_token(token).await;
  }

  let mut events = engine.subscribe();
  tokio::spawn(async move {
    while let Ok(event) = events.recv().await {
      log::info!("{}", event.to_json_string());
    }
  });

  let interrupt = tokio::signal::ctrl_c();
  tokio::pin!(interrupt);

  tokio::select! {
    (success, message) = engine.start_with_completion("cli") => {
      if !success {
        eprintln!("sync failed: {message}");
        std::process::exit(1);
      }
    }
    _ = &mut interrupt => {
      engine.cancel_sync().await;
    }
  }

  tokio::time::sleep(Duration::from_millis(10)).await;
}
