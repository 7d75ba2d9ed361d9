use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("formato de valor cifrado invalido")]
    FormatoInvalido,
    #[error("no se pudo descifrar el valor almacenado")]
    Descifrado,
}

fn clave_derivada(secreto: &str) -> [u8; 32] {
    Sha256::digest(secreto.as_bytes()).into()
}

/// Cifra el password de desbloqueo de un P12 con AES-256-CBC.
/// La clave se deriva como SHA-256 del secreto maestro del servidor y la
/// salida es `iv_hex ":" ciphertext_hex`.
pub fn cifrar_password(plano: &str, secreto: &str) -> String {
    let clave = clave_derivada(secreto);
    let mut iv = [0u8; 16];
    rand::thread_rng().fill(&mut iv);

    let cifrado = Aes256CbcEnc::new(&clave.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plano.as_bytes());

    format!("{}:{}", hex::encode(iv), hex::encode(cifrado))
}

/// Descifra un valor producido por [`cifrar_password`]. Falla cerrado: un
/// valor corrupto o cifrado con otro secreto es un error, nunca se devuelve
/// el texto almacenado tal cual.
pub fn descifrar_password(almacenado: &str, secreto: &str) -> Result<String, CryptoError> {
    let (iv_hex, ct_hex) = almacenado.split_once(':').ok_or(CryptoError::FormatoInvalido)?;
    let iv: [u8; 16] = hex::decode(iv_hex)
        .map_err(|_| CryptoError::FormatoInvalido)?
        .try_into()
        .map_err(|_| CryptoError::FormatoInvalido)?;
    let ct = hex::decode(ct_hex).map_err(|_| CryptoError::FormatoInvalido)?;

    let clave = clave_derivada(secreto);
    let plano = Aes256CbcDec::new(&clave.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| CryptoError::Descifrado)?;

    String::from_utf8(plano).map_err(|_| CryptoError::Descifrado)
}

/// Prefijo visible de las API keys emitidas.
pub const PREFIJO_API_KEY: &str = "kp_live_";

/// Genera una API key nueva. Devuelve `(clave_en_claro, prefijo, hash)`;
/// solo el hash y el prefijo se persisten, la clave en claro se muestra
/// una sola vez.
pub fn generar_api_key() -> (String, String, String) {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    let cruda = format!("{}{}", PREFIJO_API_KEY, hex::encode(bytes));
    let prefijo = cruda[..PREFIJO_API_KEY.len() + 4].to_string();
    let hash = hash_api_key(&cruda);
    (cruda, prefijo, hash)
}

/// SHA-256 en hexadecimal de una API key en claro.
pub fn hash_api_key(cruda: &str) -> String {
    let hash = Sha256::digest(cruda.as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cifrar_y_descifrar_roundtrip() {
        let cifrado = cifrar_password("clave-del-p12", "secreto-maestro");
        let (iv, ct) = cifrado.split_once(':').unwrap();
        assert_eq!(iv.len(), 32);
        assert!(ct.len() >= 32);
        assert!(ct.chars().all(|c| c.is_ascii_hexdigit()));

        let plano = descifrar_password(&cifrado, "secreto-maestro").unwrap();
        assert_eq!(plano, "clave-del-p12");
    }

    #[test]
    fn descifrado_falla_cerrado() {
        let cifrado = cifrar_password("clave", "secreto-a");
        // Secreto distinto: error, nunca el valor almacenado.
        assert!(descifrar_password(&cifrado, "secreto-b").is_err());
        // Valor legado sin formato iv:ct: error.
        assert!(matches!(
            descifrar_password("password-en-claro", "secreto-a"),
            Err(CryptoError::FormatoInvalido)
        ));
    }

    #[test]
    fn api_key_formato_y_hash() {
        let (cruda, prefijo, hash) = generar_api_key();
        assert!(cruda.starts_with("kp_live_"));
        assert_eq!(cruda.len(), "kp_live_".len() + 48);
        assert!(cruda["kp_live_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(prefijo.len(), "kp_live_".len() + 4);
        assert_eq!(hash, hash_api_key(&cruda));
        assert_eq!(hash.len(), 64);
    }
}
