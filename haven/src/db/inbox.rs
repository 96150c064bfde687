use rusqlite::params;
use rusqlite::Connection;
use rusqlite::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct InboxEntry {
    pub user: String,
    pub sender: String,
    pub message: String,
    pub timestamp: i64,
}

pub fn insert(
    conn: &Connection,
    user: &str,
    sender: &str,
    message: &str,
    timestamp: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO inbox (user, sender, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![user, sender, message, timestamp],
    )?;

    Ok(())
}

pub fn for_user(conn: &Connection, user: &str) -> Result<Vec<InboxEntry>> {
    let mut statement = conn.prepare(
        "SELECT user, sender, message, timestamp FROM inbox WHERE user = ?1 ORDER BY timestamp",
    )?;
    let messages = statement
        .query_map(params![user], |row| {
            Ok(InboxEntry {
                user: row.get(0)?,
                sender: row.get(1)?,
                message: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?
        .collect();

    messages
}

pub fn count_for_user(conn: &Connection, user: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM inbox WHERE user = ?1",
        params![user],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[test]
    fn messages_are_scoped_to_their_user() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        insert(&conn, "w1", "w2", "hello", 100).unwrap();
        insert(&conn, "w1", "w3", "again", 200).unwrap();
        insert(&conn, "w9", "w2", "other", 300).unwrap();

        let messages = for_user(&conn, "w1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message, "hello");
        assert_eq!(messages[1].message, "again");

        assert_eq!(count_for_user(&conn, "w1").unwrap(), 2);
        assert_eq!(count_for_user(&conn, "w9").unwrap(), 1);
        assert_eq!(count_for_user(&conn, "nobody").unwrap(), 0);
    }
}
