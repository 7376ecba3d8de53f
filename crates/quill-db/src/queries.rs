use crate::Database;
use crate::models::{ChatroomRow, MessageRow, UserRow};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use quill_types::models::Sender;
use rusqlite::Connection;
use uuid::Uuid;

/// Name given to chatrooms created without one.
pub const DEFAULT_CHATROOM_NAME: &str = "New Chat";

/// Storage form of a timestamp. Fixed width with microseconds, so ordering the
/// text column orders by time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    // -- Users --

    /// Returns the user registered under `mobile_number`, creating it first if
    /// this is the number's first successful login.
    pub fn find_or_create_user_by_mobile(&self, mobile_number: &str) -> Result<UserRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, mobile_number, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(mobile_number) DO NOTHING",
                (
                    Uuid::new_v4().to_string(),
                    mobile_number,
                    timestamp(Utc::now()),
                ),
            )?;
            query_user_by_mobile(conn, mobile_number)?
                .ok_or_else(|| anyhow::anyhow!("User vanished after upsert: {}", mobile_number))
        })
    }

    // -- Chatrooms --

    pub fn create_chatroom(&self, user_id: &str, name: Option<&str>) -> Result<ChatroomRow> {
        let row = ChatroomRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.unwrap_or(DEFAULT_CHATROOM_NAME).to_string(),
            created_at: timestamp(Utc::now()),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chatrooms (id, user_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                (&row.id, &row.user_id, &row.name, &row.created_at),
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// All chatrooms owned by `user_id`, newest first.
    pub fn list_chatrooms(&self, user_id: &str) -> Result<Vec<ChatroomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, created_at FROM chatrooms
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;
            let rows = stmt
                .query_map([user_id], map_chatroom)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Looks a chatroom up only if `user_id` owns it. A room owned by someone
    /// else is indistinguishable from a missing one.
    pub fn get_chatroom_for_user(&self, chatroom_id: &str, user_id: &str) -> Result<Option<ChatroomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, name, created_at FROM chatrooms WHERE id = ?1 AND user_id = ?2",
                [chatroom_id, user_id],
                map_chatroom,
            )
            .optional()
        })
    }

    // -- Messages --

    pub fn insert_message(&self, chatroom_id: &str, sender: Sender, content: &str) -> Result<MessageRow> {
        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            chatroom_id: chatroom_id.to_string(),
            sender: sender.as_str().to_string(),
            content: content.to_string(),
            created_at: timestamp(Utc::now()),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, chatroom_id, sender, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                (&row.id, &row.chatroom_id, &row.sender, &row.content, &row.created_at),
            )?;
            Ok(())
        })?;

        Ok(row)
    }

    /// Latest `limit` messages of a chatroom, newest first. `before` is an
    /// exclusive `created_at` cursor for paging back through older history.
    pub fn get_messages(&self, chatroom_id: &str, limit: u32, before: Option<&str>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_messages(conn, chatroom_id, limit, before))
    }
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        mobile_number: row.get(1)?,
        subscription_tier: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn map_chatroom(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatroomRow> {
    Ok(ChatroomRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn query_user_by_mobile(conn: &Connection, mobile_number: &str) -> Result<Option<UserRow>> {
    conn.query_row(
        "SELECT id, mobile_number, subscription_tier, created_at FROM users WHERE mobile_number = ?1",
        [mobile_number],
        map_user,
    )
    .optional()
}

fn query_messages(conn: &Connection, chatroom_id: &str, limit: u32, before: Option<&str>) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, chatroom_id, sender, content, created_at
         FROM messages
         WHERE chatroom_id = ?1
           AND (?2 IS NULL OR created_at < ?2)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![chatroom_id, before, limit], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                chatroom_id: row.get(1)?,
                sender: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_user(mobile: &str) -> (Database, UserRow) {
        let db = Database::open_in_memory().unwrap();
        let user = db.find_or_create_user_by_mobile(mobile).unwrap();
        (db, user)
    }

    #[test]
    fn user_upsert_is_idempotent_per_mobile_number() {
        let (db, first) = db_with_user("+15551234567");
        let again = db.find_or_create_user_by_mobile("+15551234567").unwrap();
        let other = db.find_or_create_user_by_mobile("+15550000000").unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.subscription_tier, "basic");
    }

    #[test]
    fn chatrooms_default_their_name_and_list_newest_first() {
        let (db, user) = db_with_user("+15551234567");
        let first = db.create_chatroom(&user.id, None).unwrap();
        let second = db.create_chatroom(&user.id, Some("Trip planning")).unwrap();

        assert_eq!(first.name, DEFAULT_CHATROOM_NAME);
        let listed: Vec<String> = db.list_chatrooms(&user.id).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);
    }

    #[test]
    fn chatroom_lookup_checks_ownership() {
        let (db, owner) = db_with_user("+15551234567");
        let intruder = db.find_or_create_user_by_mobile("+15559999999").unwrap();
        let room = db.create_chatroom(&owner.id, Some("private")).unwrap();

        assert!(db.get_chatroom_for_user(&room.id, &owner.id).unwrap().is_some());
        assert!(db.get_chatroom_for_user(&room.id, &intruder.id).unwrap().is_none());
        assert!(db.list_chatrooms(&intruder.id).unwrap().is_empty());
    }

    #[test]
    fn messages_page_backwards_from_newest() {
        let (db, user) = db_with_user("+15551234567");
        let room = db.create_chatroom(&user.id, None).unwrap();
        for i in 0..5 {
            db.insert_message(&room.id, Sender::User, &format!("msg {i}")).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let latest = db.get_messages(&room.id, 2, None).unwrap();
        assert_eq!(latest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["msg 4", "msg 3"]);

        let older = db.get_messages(&room.id, 10, Some(&latest[1].created_at)).unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].content, "msg 2");
    }

    #[test]
    fn message_insert_requires_existing_chatroom() {
        let db = Database::open_in_memory().unwrap();
        let missing = Uuid::new_v4().to_string();
        assert!(db.insert_message(&missing, Sender::Ai, "orphan").is_err());
    }
}
