use bson::Bson;

/// Coerces the numeric and boolean encodings servers use for status fields
/// (`ok`, `ismaster`) into a bool.
pub(crate) fn as_bool(bson: &Bson) -> Option<bool> {
    match bson {
        Bson::Boolean(b) => Some(*b),
        Bson::Int32(i) => Some(*i != 0),
        Bson::Int64(i) => Some(*i != 0),
        Bson::Double(d) => Some(*d != 0.0),
        _ => None,
    }
}

/// Coerces any numeric encoding into an i64, the way servers report counts.
pub(crate) fn as_i64(bson: &Bson) -> Option<i64> {
    match bson {
        Bson::Int32(i) => Some(*i as i64),
        Bson::Int64(i) => Some(*i),
        Bson::Double(d) => Some(*d as i64),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use bson::Bson;

    use super::{as_bool, as_i64};

    #[test]
    fn coerces_server_status_values() {
        assert_eq!(as_bool(&Bson::Double(1.0)), Some(true));
        assert_eq!(as_bool(&Bson::Double(0.0)), Some(false));
        assert_eq!(as_bool(&Bson::Int32(1)), Some(true));
        assert_eq!(as_bool(&Bson::Boolean(false)), Some(false));
        assert_eq!(as_bool(&Bson::String("1".to_string())), None);
    }

    #[test]
    fn coerces_counts() {
        assert_eq!(as_i64(&Bson::Double(3.0)), Some(3));
        assert_eq!(as_i64(&Bson::Int32(7)), Some(7));
        assert_eq!(as_i64(&Bson::Int64(9)), Some(9));
        assert_eq!(as_i64(&Bson::String("9".to_string())), None);
    }
}
