use crate::bson::{Bson, RawBsonRef};

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not numeric
/// or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int_raw(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int32(i) => get_int(&Bson::Int32(i)),
        RawBsonRef::Int64(i) => get_int(&Bson::Int64(i)),
        RawBsonRef::Double(i) => get_int(&Bson::Double(i)),
        _ => None,
    }
}

/// Reads a cursor id, which servers may report as any integral numeric type.
pub(crate) fn get_cursor_id(val: RawBsonRef<'_>) -> Option<i64> {
    match val {
        RawBsonRef::Int64(i) => Some(i),
        RawBsonRef::Int32(i) => Some(i64::from(i)),
        other => get_int_raw(other),
    }
}

#[cfg(test)]
mod test {
    use super::{get_int, get_int_raw};
    use crate::bson::{Bson, RawBsonRef};

    #[test]
    fn lossless_integer_coercion() {
        assert_eq!(get_int(&Bson::Int32(5)), Some(5));
        assert_eq!(get_int(&Bson::Double(2.0)), Some(2));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".into())), None);
        assert_eq!(get_int_raw(RawBsonRef::Int64(-3)), Some(-3));
    }
}
