use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::ObjectKind;
use crate::types::commit::{split_headers, write_extra_headers, Signature};

/// an annotated tag object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: Option<Signature>,
    pub extra_headers: Vec<(String, String)>,
    pub message: String,
}

impl Tag {
    pub fn new(
        object: ObjectId,
        target_kind: ObjectKind,
        name: impl Into<String>,
        tagger: Signature,
        message: impl Into<String>,
    ) -> Self {
        Self {
            object,
            target_kind,
            name: name.into(),
            tagger: Some(tagger),
            extra_headers: vec![],
            message: message.into(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let (headers, message) = split_headers(&text);

        let mut object = None;
        let mut target_kind = None;
        let mut name = None;
        let mut tagger = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key.as_str() {
                "object" => object = Some(ObjectId::from_hex(&value)?),
                "type" => target_kind = Some(value.parse::<ObjectKind>()?),
                "tag" => name = Some(value),
                "tagger" => tagger = Some(Signature::parse(&value)?),
                _ => extra_headers.push((key, value)),
            }
        }

        let missing = |field: &str| Error::CorruptObjectMessage(format!("tag without {}", field));
        Ok(Self {
            object: object.ok_or_else(|| missing("object"))?,
            target_kind: target_kind.ok_or_else(|| missing("type"))?,
            name: name.ok_or_else(|| missing("name"))?,
            tagger,
            extra_headers,
            message,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("object {}\n", self.object));
        out.push_str(&format!("type {}\n", self.target_kind));
        out.push_str(&format!("tag {}\n", self.name));
        if let Some(tagger) = &self.tagger {
            out.push_str(&format!("tagger {}\n", tagger));
        }
        write_extra_headers(&mut out, &self.extra_headers);
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }
}
