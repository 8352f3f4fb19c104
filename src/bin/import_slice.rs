use std::sync::Arc;

use clap::{Arg, Command};
use rusqlite::Connection;

use slice_import::{ReqwestPlatform, SliceImportEngine};
use sqlite_batch::SqliteDatabase;

#[tokio::main]
async fn main() {
  env_logger::init();

  let cmd = Command::new("import-slice")
    .version("1.0")
    .arg(Arg::new("url").required(true).short('u').long("url"))
    .arg(Arg::new("database").required(true).short('d').long("database"));

  let mut matches = cmd.get_matches();
  let url = matches.remove_one::<String>("url").unwrap();
  let database_path = matches.remove_one::<String>("database").unwrap();

  let conn = Connection::open(&database_path).expect("failed to open sqlite database");
  let db = Arc::new(SqliteDatabase::new(conn));
  let platform = Arc::new(ReqwestPlatform::new());
  let engine = SliceImportEngine::new(db, platform);

  match engine.start_import(&url).await {
    Ok(()) => {
      log::info!("import complete: {} row(s) inserted", engine.total_rows_inserted());
    }
    Err(e) => {
      eprintln!("import failed: {}", e.message());
      std::process::exit(1);
    }
  }
}
