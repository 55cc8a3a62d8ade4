use serde::{Deserialize, Deserializer};

const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats: https://stackoverflow.com/a/41139453.
/// To avoid this, refuse to convert floats with magnitude greater than 2**53 - 1, after which 64-bit floats no longer
/// retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Renders a number the way the server does: integral values carry no fractional part.
#[allow(clippy::float_cmp)]
pub(crate) fn number_to_string(f: f64) -> String {
    match f64_to_i64_safe(f) {
        Some(i) if i as f64 == f => i.to_string(),
        _ => f.to_string(),
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// Deserializes an explicit `null` the same way as an absent field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1.0, "1")]
    #[test_case(-12.0, "-12")]
    #[test_case(1.5, "1.5")]
    #[test_case(0.0, "0")]
    fn numbers_render_without_trailing_fraction(have: f64, expect: &str) {
        assert_eq!(number_to_string(have), expect);
    }
}
