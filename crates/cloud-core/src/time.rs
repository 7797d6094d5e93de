//! Single `utc_now()` seam so tests can reason about time without
//! touching `chrono::Utc::now()` directly everywhere.

use chrono::{DateTime, Utc};

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_now_is_recent() {
        let now = utc_now();
        assert!(now.timestamp() > 0);
    }
}
