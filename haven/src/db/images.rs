use overlay_node::ArtifactId;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub id: i64,
    #[serde(rename = "address")]
    pub wallet: String,
    #[serde(rename = "postId")]
    pub post: String,
    pub data: Vec<u8>,
    pub active: bool,
}

/// Stores an uploaded artifact and returns the local id assigned to it.
pub fn insert(conn: &Connection, wallet: &str, post: &str, data: &[u8]) -> Result<i64> {
    conn.execute(
        "INSERT INTO images (wallet, post, data) VALUES (?1, ?2, ?3)",
        params![wallet, post, data],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: &ArtifactId) -> Result<Option<Image>> {
    conn.query_row(
        "SELECT id, wallet, post, data, active FROM images \
         WHERE id = ?1 AND post = ?2 AND wallet = ?3",
        params![id.local_id, id.post_id, id.wallet],
        from_row,
    )
    .optional()
}

pub fn all(conn: &Connection) -> Result<Vec<Image>> {
    let mut statement =
        conn.prepare("SELECT id, wallet, post, data, active FROM images ORDER BY id")?;
    let images = statement.query_map([], from_row)?.collect();

    images
}

/// Flips the serving flag and returns the updated row, if any.
pub fn set_active(conn: &Connection, id: &ArtifactId, active: bool) -> Result<Option<Image>> {
    conn.execute(
        "UPDATE images SET active = ?1 WHERE id = ?2 AND post = ?3 AND wallet = ?4",
        params![active, id.local_id, id.post_id, id.wallet],
    )?;

    get(conn, id)
}

fn from_row(row: &rusqlite::Row<'_>) -> Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        wallet: row.get(1)?,
        post: row.get(2)?,
        data: row.get(3)?,
        active: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[test]
    fn upload_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let local_id = insert(&conn, "w1", "p1", b"image bytes").unwrap();
        let id = format!("w1:p1:{local_id}").parse::<ArtifactId>().unwrap();

        let image = get(&conn, &id).unwrap().unwrap();
        assert_eq!(image.data, b"image bytes");
        assert!(image.active);
    }

    #[test]
    fn local_ids_are_assigned_in_sequence() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let first = insert(&conn, "w1", "p1", b"a").unwrap();
        let second = insert(&conn, "w1", "p1", b"b").unwrap();

        assert!(second > first);
    }

    #[test]
    fn lookup_requires_the_full_identifier() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let local_id = insert(&conn, "w1", "p1", b"image bytes").unwrap();

        let wrong_wallet = format!("w2:p1:{local_id}").parse::<ArtifactId>().unwrap();
        assert!(get(&conn, &wrong_wallet).unwrap().is_none());

        let wrong_post = format!("w1:p2:{local_id}").parse::<ArtifactId>().unwrap();
        assert!(get(&conn, &wrong_post).unwrap().is_none());
    }

    #[test]
    fn set_active_flips_the_serving_flag() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let local_id = insert(&conn, "w1", "p1", b"image bytes").unwrap();
        let id = format!("w1:p1:{local_id}").parse::<ArtifactId>().unwrap();

        let image = set_active(&conn, &id, false).unwrap().unwrap();
        assert!(!image.active);

        let image = set_active(&conn, &id, true).unwrap().unwrap();
        assert!(image.active);
    }
}
