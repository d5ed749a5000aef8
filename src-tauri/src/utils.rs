use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Миллисекунды с начала эпохи, как `Date.now()` у браузерного клиента
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
