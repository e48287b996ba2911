//! Contrato de serialización de valores: un número decimal en texto por objeto,
//! sin metadatos. Todo valor que cruza el object store pasa por acá.

use bytes::Bytes;

use crate::error::CodecError;

pub fn encode_value(value: f64) -> Bytes {
    Bytes::from(value.to_string())
}

pub fn decode_value(raw: &[u8]) -> Result<f64, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    let text = text.trim_matches(|c: char| c.is_ascii_whitespace());
    if text.is_empty() {
        return Err(CodecError::Empty);
    }

    let value: f64 = text
        .parse()
        .map_err(|_| CodecError::NotANumber(text.to_string()))?;

    if !value.is_finite() {
        return Err(CodecError::NonFinite(value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escribe_solo_el_numero() {
        assert_eq!(&encode_value(4.0)[..], b"4");
        assert_eq!(&encode_value(0.0)[..], b"0");
        assert_eq!(&encode_value(2.75)[..], b"2.75");
    }

    #[test]
    fn decode_acepta_salto_de_linea_final() {
        assert_eq!(decode_value(b"2.5\n"), Ok(2.5));
        assert_eq!(decode_value(b" 4 "), Ok(4.0));
        assert_eq!(decode_value(&encode_value(0.1 + 0.2)), Ok(0.1 + 0.2));
    }

    #[test]
    fn decode_rechaza_basura() {
        assert_eq!(decode_value(b""), Err(CodecError::Empty));
        assert_eq!(decode_value(b"  \n"), Err(CodecError::Empty));
        assert_eq!(
            decode_value(b"4,0"),
            Err(CodecError::NotANumber("4,0".to_string()))
        );
        assert!(matches!(decode_value(b"NaN"), Err(CodecError::NonFinite(_))));
        assert!(matches!(decode_value(b"inf"), Err(CodecError::NonFinite(_))));
        assert_eq!(decode_value(&[0xff, 0xfe]), Err(CodecError::NotUtf8));
    }
}
