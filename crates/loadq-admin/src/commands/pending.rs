//! `loadq-admin clear-pending` command implementation

use crate::api::AdminClient;
use crate::error::{AdminError, Result};

pub async fn clear(client: &AdminClient, database: &str, table: &str, yes: bool) -> Result<()> {
    if !yes {
        return Err(AdminError::invalid_argument(format!(
            "clearing the queue of {}.{} drops those loads; pass --yes to confirm",
            database, table
        )));
    }

    let cleared = client.clear_pending(database, table).await?;
    println!(
        "Deleted {} pending load(s) from {}.{}",
        cleared.deleted,
        cleared.load_key.database(),
        cleared.load_key.table()
    );
    Ok(())
}
