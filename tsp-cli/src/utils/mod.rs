mod time;

pub use self::time::parse_time;
