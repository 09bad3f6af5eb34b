//! Data package envelope exchanged over TCP

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::clipboard::{ImagePayload, MimeEntry, Payload};
use crate::{Error, Result};

/// Image attached to a package. `image_type` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub image_type: String,
    /// Base64 of the encoded image file
    pub image_data: String,
}

/// One unit of shared clipboard content.
///
/// `mime_formats[i]` describes `mime_data[i]`; every entry of `mime_data` is
/// base64 so arbitrary bytes survive the JSON envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPackage {
    pub mime_formats: Vec<String>,
    pub mime_data: Vec<String>,
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    pub sender: String,
    pub receiver: String,
}

impl DataPackage {
    /// Build a package from a local payload.
    ///
    /// An image without a format is tagged with `default_image_format`.
    pub fn from_payload(payload: &Payload, sender: &str, default_image_format: &str) -> Self {
        let mut package = Self {
            sender: sender.to_string(),
            ..Default::default()
        };

        for entry in &payload.entries {
            package.mime_formats.push(entry.format.clone());
            package.mime_data.push(BASE64.encode(&entry.data));
        }

        if let Some(image) = &payload.image {
            let image_type = if image.format.is_empty() {
                tracing::trace!("image attachment without format, using {}", default_image_format);
                default_image_format.to_string()
            } else {
                image.format.clone()
            };
            package.image = Some(ImageAttachment {
                image_type,
                image_data: BASE64.encode(&image.data),
            });
        }

        package
    }

    /// Decode the base64 entries back into a raw payload
    pub fn to_payload(&self) -> Result<Payload> {
        self.validate()?;

        let entries = self
            .mime_formats
            .iter()
            .zip(&self.mime_data)
            .map(|(format, data)| {
                let data = BASE64.decode(data).map_err(|e| {
                    Error::InvalidPackage(format!("bad base64 for {}: {}", format, e))
                })?;
                Ok(MimeEntry {
                    format: format.clone(),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let image = match &self.image {
            Some(attachment) => Some(ImagePayload {
                format: attachment.image_type.clone(),
                data: BASE64.decode(&attachment.image_data).map_err(|e| {
                    Error::InvalidPackage(format!("bad base64 for image: {}", e))
                })?,
            }),
            None => None,
        };

        Ok(Payload { entries, image })
    }

    /// Check the structural invariants of a received package
    pub fn validate(&self) -> Result<()> {
        if self.mime_formats.len() != self.mime_data.len() {
            return Err(Error::InvalidPackage(format!(
                "{} formats but {} data entries",
                self.mime_formats.len(),
                self.mime_data.len()
            )));
        }
        for (format, data) in self.mime_formats.iter().zip(&self.mime_data) {
            if BASE64.decode(data).is_err() {
                return Err(Error::InvalidPackage(format!("bad base64 for {}", format)));
            }
        }
        if let Some(image) = &self.image {
            if image.image_type.is_empty() {
                return Err(Error::InvalidPackage("image attachment without type".to_string()));
            }
            if BASE64.decode(&image.image_data).is_err() {
                return Err(Error::InvalidPackage("bad base64 for image".to_string()));
            }
        }
        Ok(())
    }

    /// Serialize the package body (JSON, no length prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize and validate a package body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let package: Self = serde_json::from_slice(bytes)?;
        package.validate()?;
        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_payload_is_base64() {
        let payload = Payload::text("hello");
        let package = DataPackage::from_payload(&payload, "host-a", "png");

        assert_eq!(package.mime_formats, vec!["text/plain"]);
        assert_eq!(package.mime_data, vec!["aGVsbG8="]);
        assert_eq!(package.sender, "host-a");
        assert!(package.image.is_none());

        let decoded = package.to_payload().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_image_format_uses_default() {
        let payload = Payload {
            entries: Vec::new(),
            image: Some(ImagePayload {
                format: String::new(),
                data: vec![0x89, b'P', b'N', b'G'],
            }),
        };
        let package = DataPackage::from_payload(&payload, "host-a", "png");
        let image = package.image.as_ref().unwrap();
        assert_eq!(image.image_type, "png");

        let decoded = package.to_payload().unwrap();
        assert_eq!(decoded.image.unwrap().data, vec![0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn test_body_roundtrip() {
        let package = DataPackage {
            mime_formats: vec!["text/plain".into(), "text/html".into()],
            mime_data: vec![BASE64.encode("hi"), BASE64.encode("<b>hi</b>")],
            image: Some(ImageAttachment {
                image_type: "jpg".into(),
                image_data: BASE64.encode([1u8, 2, 3]),
            }),
            sender: "a".into(),
            receiver: "b".into(),
        };
        let bytes = package.to_bytes().unwrap();
        assert_eq!(DataPackage::from_bytes(&bytes).unwrap(), package);

        let empty = DataPackage::default();
        let bytes = empty.to_bytes().unwrap();
        assert_eq!(DataPackage::from_bytes(&bytes).unwrap(), empty);
    }

    #[test]
    fn test_wire_field_names() {
        let package = DataPackage::from_payload(&Payload::text("x"), "a", "png");
        let json: serde_json::Value = serde_json::from_slice(&package.to_bytes().unwrap()).unwrap();
        assert!(json.get("mimeFormats").is_some());
        assert!(json.get("mimeData").is_some());
        assert!(json.get("sender").is_some());
        assert!(json.get("receiver").is_some());
    }

    #[test]
    fn test_rejects_mismatched_lengths() {
        let bytes = br#"{"mimeFormats":["text/plain"],"mimeData":[],"sender":"a","receiver":"b"}"#;
        assert!(matches!(DataPackage::from_bytes(bytes), Err(Error::InvalidPackage(_))));
    }

    #[test]
    fn test_rejects_trailing_content() {
        let mut bytes = DataPackage::default().to_bytes().unwrap();
        bytes.extend_from_slice(b"garbage");
        assert!(matches!(DataPackage::from_bytes(&bytes), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_bad_base64_is_reported() {
        let package = DataPackage {
            mime_formats: vec!["text/plain".into()],
            mime_data: vec!["not base64!".into()],
            ..Default::default()
        };
        assert!(matches!(package.to_payload(), Err(Error::InvalidPackage(_))));

        let bytes = serde_json::to_vec(&package).unwrap();
        assert!(matches!(DataPackage::from_bytes(&bytes), Err(Error::InvalidPackage(_))));
    }
}
