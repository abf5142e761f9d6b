use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Random helpers used for short, human-readable ids
pub struct RngUtils;

impl RngUtils {
    /// Generate a random string of default length (16 characters)
    pub fn random_string() -> String {
        Self::random_string_with_length(16)
    }

    /// Generate a random string of specified length using alphanumeric characters
    pub fn random_string_with_length(length: usize) -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Generate a short id with a one-letter kind prefix, e.g. `R4kQ9zT1b`
    pub fn prefixed_id(prefix: char) -> String {
        let mut id = String::with_capacity(9);
        id.push(prefix);
        id.push_str(&Self::random_string_with_length(8));
        id
    }
}
