use brine_storage::Jid;
use chrono::{DateTime, Local};

/// `%Y%m%d%H%M%S%f` with microseconds, plus `_<pid>` when `unique`.
pub fn format_jid(at: DateTime<Local>, unique: bool) -> Jid {
    let stamp = at.format("%Y%m%d%H%M%S%6f").to_string();
    if unique {
        Jid(format!("{}_{}", stamp, std::process::id()))
    } else {
        Jid(stamp)
    }
}

pub fn gen_jid(unique: bool) -> Jid {
    format_jid(Local::now(), unique)
}

/// Whether `jid` looks like something this master could have produced.
pub fn is_jid(jid: &str) -> bool {
    let stamp = jid.split_once('_').map(|(s, _)| s).unwrap_or(jid);
    stamp.len() == 20 && stamp.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn twenty_digits() {
        let at = Local
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(42))
            .unwrap();
        assert_eq!(format_jid(at, false).0, "20240309070501000042");
        let unique = format_jid(at, true).0;
        assert_eq!(unique, format!("20240309070501000042_{}", std::process::id()));
        assert!(is_jid(&unique));
        assert!(is_jid(&gen_jid(false).0));
        assert!(!is_jid("req"));
    }
}
