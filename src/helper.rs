use std::{collections::BTreeMap, time::Duration};

use crate::{
    Error, Result,
    crd::{AKODeploymentConfig, AVI_CERTIFICATE_KEY, AVI_PASSWORD_KEY, AVI_USERNAME_KEY, SecretReference},
};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use rand::Rng;

pub enum Decoded {
    /// Usually secrets are just short utf8 encoded strings
    Utf8(String),
    /// But it's allowed to just base64 encode binary in the values
    Bytes(Vec<u8>),
}

pub fn decode_secret(secret: &Secret) -> BTreeMap<String, Decoded> {
    let mut res = BTreeMap::new();
    if let Some(data) = secret.data.clone() {
        for (k, v) in data {
            if let Ok(b) = std::str::from_utf8(&v.0) {
                res.insert(k, Decoded::Utf8(b.to_string()));
            } else {
                res.insert(k, Decoded::Bytes(v.0));
            }
        }
    }
    // stringData is write-only on the server but shows up on objects built locally
    if let Some(string_data) = secret.string_data.clone() {
        for (k, v) in string_data {
            res.entry(k).or_insert(Decoded::Utf8(v));
        }
    }
    res
}

/// UTF-8 value of `key`, failing when the key is absent or binary.
pub fn secret_string(secret: &Secret, key: &str) -> Result<String> {
    match decode_secret(secret).remove(key) {
        Some(Decoded::Utf8(s)) => Ok(s),
        Some(Decoded::Bytes(_)) => Err(Error::InvalidInput(format!(
            "secret key {key} is not valid utf8"
        ))),
        None => Err(Error::NotFound(format!("secret key {key}"))),
    }
}

pub async fn get_secret_opt(client: &Client, namespace: &str, name: &str) -> Result<Option<Secret>> {
    Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(name)
        .await
        .map_err(Error::KubeError)
}

pub async fn get_secret(client: &Client, reference: &SecretReference) -> Result<Secret> {
    get_secret_opt(client, &reference.namespace, &reference.name)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!("secret {}/{}", reference.namespace, reference.name))
        })
}

/// Admin username and password referenced by the ADC.
pub async fn admin_credentials(client: &Client, adc: &AKODeploymentConfig) -> Result<(String, String)> {
    let secret = get_secret(client, &adc.spec.admin_credential_ref).await?;
    Ok((
        secret_string(&secret, AVI_USERNAME_KEY)?,
        secret_string(&secret, AVI_PASSWORD_KEY)?,
    ))
}

/// PEM bundle of the AVI controller referenced by the ADC.
pub async fn controller_ca(client: &Client, adc: &AKODeploymentConfig) -> Result<String> {
    let secret = get_secret(client, &adc.spec.certificate_authority_ref).await?;
    secret_string(&secret, AVI_CERTIFICATE_KEY)
}

/// Spreads `base` by a random factor in [0.5, 1.5).
pub fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn decode_secret_distinguishes_utf8_and_binary() {
        let mut secret = Secret::default();
        secret.data = Some(BTreeMap::from([
            ("plain".into(), ByteString(b"hello".to_vec())),
            ("bin".into(), ByteString(vec![0u8, 159u8])),
        ]));

        let decoded = decode_secret(&secret);
        match decoded.get("plain").unwrap() {
            Decoded::Utf8(s) => assert_eq!(s, "hello"),
            _ => panic!("expected utf8"),
        }
        match decoded.get("bin").unwrap() {
            Decoded::Bytes(bytes) => assert_eq!(bytes, &vec![0u8, 159u8]),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn secret_string_reads_data_then_string_data() {
        let mut secret = Secret::default();
        secret.data = Some(BTreeMap::from([(
            "username".into(),
            ByteString(b"admin".to_vec()),
        )]));
        secret.string_data = Some(BTreeMap::from([
            ("username".into(), "ignored".into()),
            ("password".into(), "p@ss".into()),
        ]));
        assert_eq!(secret_string(&secret, "username").unwrap(), "admin");
        assert_eq!(secret_string(&secret, "password").unwrap(), "p@ss");
        assert!(secret_string(&secret, "certificateAuthorityData").is_err());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(5) && d < Duration::from_secs(15));
        }
    }
}
