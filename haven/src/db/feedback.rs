use rusqlite::params;
use rusqlite::Connection;
use rusqlite::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: i64,
    #[serde(rename = "feedbackType")]
    pub feedback_type: String,
    pub wallet: String,
    pub target: String,
    pub content: String,
    pub done: bool,
}

pub fn insert(
    conn: &Connection,
    feedback_type: &str,
    wallet: &str,
    target: &str,
    content: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO feedback (type, wallet, target, content) VALUES (?1, ?2, ?3, ?4)",
        params![feedback_type, wallet, target, content],
    )?;

    Ok(())
}

pub fn all(conn: &Connection) -> Result<Vec<Feedback>> {
    let mut statement =
        conn.prepare("SELECT id, type, wallet, target, content, done FROM feedback ORDER BY id")?;
    let feedback = statement
        .query_map([], |row| {
            Ok(Feedback {
                id: row.get(0)?,
                feedback_type: row.get(1)?,
                wallet: row.get(2)?,
                target: row.get(3)?,
                content: row.get(4)?,
                done: row.get(5)?,
            })
        })?
        .collect();

    feedback
}
