//! Row types as stored. Ids and timestamps stay text here; the API layer
//! parses them.

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub mobile_number: String,
    pub subscription_tier: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ChatroomRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub chatroom_id: String,
    pub sender: String,
    pub content: String,
    pub created_at: String,
}
