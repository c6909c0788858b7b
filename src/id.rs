use chrono::Utc;

/// New unique id derived from the creation timestamp plus a random suffix.
///
/// The millisecond timestamp keeps ids sortable by creation time; the random
/// tail disambiguates ids minted within the same millisecond.
pub fn new_id(prefix: &str) -> String {
    let ts = Utc::now().timestamp_millis();
    let rand: u32 = rand::random();
    format!("{}_{}_{:08x}", prefix, ts, rand)
}

/// Extract the creation timestamp (millis) back out of an id.
pub fn id_timestamp(id: &str) -> Option<i64> {
    id.split('_').nth(1)?.parse().ok()
}
