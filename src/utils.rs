use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Adds a protocol scheme to an ICE server URL if it has none.
/// Descriptors carrying credentials are treated as TURN relays.
pub fn add_ice_url_scheme(url: &str, has_credentials: bool) -> String {
    if ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        url.to_string()
    } else {
        let scheme = if has_credentials { "turn:" } else { "stun:" };
        format!("{}{}", scheme, url)
    }
}
