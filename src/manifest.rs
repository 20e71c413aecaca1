// Copyright 2025 Cowboy AI, LLC.

//! Transitive aspects manifest
//!
//! When a compilation finishes, its inheritable aspect instances are
//! projected into durable form and embedded in the produced assembly under
//! [`MANIFEST_RESOURCE_NAME`]. A later compilation that references the
//! assembly reads the manifest back and re-creates the instances on its own
//! derived declarations.
//!
//! The blob is bincode inside zstd behind a 4-byte magic and a format
//! version. Payloads that must stay schema-free (the aspect value, the
//! cross-layer state, validator payloads) travel as JSON text inside the
//! binary envelope.

use crate::aggregate::AggregatedAspectInstance;
use crate::declaration::DeclarationRef;
use crate::errors::{AspectError, AspectResult};
use crate::instance::{AspectInstance, AspectInstanceArena};
use crate::snapshot::AssemblyIdentity;
use crate::user_code::run_user_code;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Well-known resource name the manifest is stored under
pub const MANIFEST_RESOURCE_NAME: &str = "CimAspects.TransitiveManifest";

/// Format version written into every manifest header
pub const MANIFEST_FORMAT_VERSION: u16 = 1;

const MANIFEST_MAGIC: [u8; 4] = *b"CATM";
const MANIFEST_HEADER_LEN: usize = MANIFEST_MAGIC.len() + 2;

/// JSON payloads embedded as text inside the binary envelope
mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &serde_json::Value,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<serde_json::Value, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}

/// Optional JSON payloads embedded as text
mod opt_json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<serde_json::Value>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => {
                let text = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<serde_json::Value>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Durable projection of one inheritable aspect instance
///
/// The degree stored here is the source instance's degree plus one: the
/// cross-assembly hop is counted at serialization time, so consumers use
/// the stored value verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InheritableAspectInstance {
    /// Durable reference to the declaration that carried the instance
    pub target: DeclarationRef,
    /// Containment depth of that declaration in the source compilation
    pub target_depth: u32,
    /// Full name of the aspect class
    pub aspect_class: String,
    /// Serialized aspect value
    #[serde(with = "json_text")]
    #[schemars(with = "String")]
    pub aspect_payload: serde_json::Value,
    /// Serialized cross-layer state, if the instance stored any
    #[serde(with = "opt_json_text")]
    #[schemars(with = "Option<String>")]
    pub state: Option<serde_json::Value>,
    /// Predecessor degree already bumped for the cross-assembly hop
    pub degree: u32,
    /// Projections of the secondary instances merged under this one
    pub secondary: Vec<InheritableAspectInstance>,
}

/// Durable description of a cross-assembly reference validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceValidator {
    /// Full name of the validator type in the source assembly
    pub validator_type: String,
    /// Declaration whose references are validated
    pub target: DeclarationRef,
    /// Opaque validator configuration
    #[serde(with = "json_text")]
    #[schemars(with = "String")]
    pub payload: serde_json::Value,
}

/// Everything one assembly exports for consumers of its aspects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransitiveAspectsManifest {
    /// Format version, mirrors the header
    pub format_version: u16,
    /// Assembly that produced the manifest
    pub source: AssemblyIdentity,
    /// When the manifest was built
    pub created_at: DateTime<Utc>,
    /// Inheritable instances keyed by aspect-class full name
    pub aspects: IndexMap<String, Vec<InheritableAspectInstance>>,
    /// Reference validators to re-run in consuming compilations
    pub validators: Vec<ReferenceValidator>,
}

impl TransitiveAspectsManifest {
    /// Create an empty manifest for the given source assembly
    pub fn new(source: AssemblyIdentity) -> Self {
        TransitiveAspectsManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            source,
            created_at: Utc::now(),
            aspects: IndexMap::new(),
            validators: Vec::new(),
        }
    }

    /// Whether the manifest exports nothing
    pub fn is_empty(&self) -> bool {
        self.aspects.is_empty() && self.validators.is_empty()
    }

    /// Total number of exported instances across all classes
    pub fn instance_count(&self) -> usize {
        self.aspects.values().map(Vec::len).sum()
    }

    /// Instances exported for one aspect class
    pub fn aspects_of(&self, class_name: &str) -> &[InheritableAspectInstance] {
        self.aspects
            .get(class_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append an exported instance under its class
    pub fn insert_aspect(&mut self, instance: InheritableAspectInstance) {
        self.aspects
            .entry(instance.aspect_class.clone())
            .or_default()
            .push(instance);
    }

    /// Encode to the resource blob: magic, version, zstd(bincode(self))
    pub fn encode(&self) -> AspectResult<Bytes> {
        let body = bincode::serialize(self)?;
        let compressed = zstd::encode_all(body.as_slice(), zstd::DEFAULT_COMPRESSION_LEVEL)
            .map_err(|e| AspectError::Manifest(format!("compression failed: {e}")))?;

        let mut blob = Vec::with_capacity(MANIFEST_HEADER_LEN + compressed.len());
        blob.extend_from_slice(&MANIFEST_MAGIC);
        blob.extend_from_slice(&MANIFEST_FORMAT_VERSION.to_le_bytes());
        blob.extend_from_slice(&compressed);

        debug!(
            source = %self.source,
            instances = self.instance_count(),
            bytes = blob.len(),
            "encoded transitive aspects manifest"
        );
        Ok(Bytes::from(blob))
    }

    /// Decode a resource blob
    ///
    /// Rejects bad magic, unknown format versions, and corrupt bodies.
    /// Callers reading referenced assemblies treat any error as "this
    /// assembly has no manifest" after logging it.
    pub fn decode(data: &[u8]) -> AspectResult<Self> {
        if data.len() < MANIFEST_HEADER_LEN {
            return Err(AspectError::Manifest("blob too short".to_string()));
        }
        if data[..MANIFEST_MAGIC.len()] != MANIFEST_MAGIC {
            return Err(AspectError::Manifest("bad magic".to_string()));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != MANIFEST_FORMAT_VERSION {
            return Err(AspectError::Manifest(format!(
                "unsupported format version {version}"
            )));
        }

        let body = zstd::decode_all(&data[MANIFEST_HEADER_LEN..])
            .map_err(|e| AspectError::Manifest(format!("decompression failed: {e}")))?;
        let manifest: TransitiveAspectsManifest =
            bincode::deserialize(&body).map_err(|e| AspectError::Manifest(e.to_string()))?;

        debug!(
            source = %manifest.source,
            instances = manifest.instance_count(),
            "decoded transitive aspects manifest"
        );
        Ok(manifest)
    }
}

/// Project a finished compilation's inheritable aggregates into a manifest
///
/// Skipped primaries are not exported (they failed); non-inheritable
/// aggregates are not exported. Aggregates should arrive in deterministic
/// order, the manifest preserves it.
pub fn build_manifest(
    arena: &AspectInstanceArena,
    source: AssemblyIdentity,
    aggregates: &[AggregatedAspectInstance],
    validators: Vec<ReferenceValidator>,
) -> AspectResult<TransitiveAspectsManifest> {
    let mut manifest = TransitiveAspectsManifest::new(source);

    for aggregate in aggregates {
        if !aggregate.is_inheritable() || aggregate.is_skipped() {
            continue;
        }
        let mut projection = project_instance(arena, aggregate.primary())?;
        for secondary in aggregate.secondary() {
            projection.secondary.push(project_instance(arena, secondary)?);
        }
        manifest.insert_aspect(projection);
    }

    manifest.validators = validators;
    Ok(manifest)
}

fn project_instance(
    arena: &AspectInstanceArena,
    instance: &AspectInstance,
) -> AspectResult<InheritableAspectInstance> {
    let class_name = instance.class().full_name();
    let payload = run_user_code(class_name, "serialize", || instance.aspect().to_json())?;

    Ok(InheritableAspectInstance {
        target: instance.target().clone(),
        target_depth: instance.target_depth(),
        aspect_class: class_name.to_string(),
        aspect_payload: payload,
        state: instance.state(),
        degree: arena.degree(instance.id()) + 1,
        secondary: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::aspect::Aspect;
    use crate::aspect_class::{AspectClass, Inheritance};
    use crate::driver::AspectBuilder;
    use crate::predecessor::{AspectPredecessor, AttributeRef};
    use std::any::Any;
    use std::sync::Arc;

    #[derive(Debug)]
    struct CacheAspect {
        seconds: u64,
    }

    impl Aspect for CacheAspect {
        fn build(&self, _builder: &mut AspectBuilder<'_>) -> crate::errors::AspectResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn to_json(&self) -> crate::errors::AspectResult<serde_json::Value> {
            Ok(serde_json::json!({ "seconds": self.seconds }))
        }
    }

    fn inheritable_class(name: &str) -> Arc<AspectClass> {
        Arc::new(
            AspectClass::builder(name)
                .inheritance(Inheritance::Always)
                .deserializer(|payload| {
                    let seconds = payload["seconds"].as_u64().unwrap_or(0);
                    Ok(Arc::new(CacheAspect { seconds }) as Arc<dyn Aspect>)
                })
                .build()
                .unwrap(),
        )
    }

    fn sample_manifest() -> TransitiveAspectsManifest {
        let mut manifest =
            TransitiveAspectsManifest::new(AssemblyIdentity::new("Acme.Core", "1.2.0"));
        manifest.insert_aspect(InheritableAspectInstance {
            target: DeclarationRef::new("T:Acme.Base"),
            target_depth: 1,
            aspect_class: "Acme.CacheAspect".to_string(),
            aspect_payload: serde_json::json!({ "seconds": 30 }),
            state: Some(serde_json::json!({ "layer": 1 })),
            degree: 1,
            secondary: vec![],
        });
        manifest.validators.push(ReferenceValidator {
            validator_type: "Acme.NoInternalAccess".to_string(),
            target: DeclarationRef::new("T:Acme.Base"),
            payload: serde_json::json!({ "severity": "warning" }),
        });
        manifest
    }

    /// Test the blob round-trips
    ///
    /// ```mermaid
    /// graph TD
    ///     A[manifest] -->|bincode| B[body]
    ///     B -->|zstd| C[compressed]
    ///     C -->|magic + version| D[blob]
    ///     D -->|decode| A2[manifest]
    /// ```
    #[test]
    fn test_encode_decode_round_trip() {
        let manifest = sample_manifest();

        let blob = manifest.encode().unwrap();
        assert_eq!(&blob[..4], b"CATM");

        let decoded = TransitiveAspectsManifest::decode(&blob).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.instance_count(), 1);
        assert_eq!(decoded.aspects_of("Acme.CacheAspect").len(), 1);
        assert_eq!(
            decoded.aspects_of("Acme.CacheAspect")[0].aspect_payload["seconds"],
            30
        );
    }

    /// Test decode rejects garbage
    #[test]
    fn test_decode_rejects_garbage() {
        let err = TransitiveAspectsManifest::decode(b"xx").unwrap_err();
        assert!(err.to_string().contains("too short"));

        let err = TransitiveAspectsManifest::decode(b"NOPE\x01\x00rest").unwrap_err();
        assert!(err.to_string().contains("bad magic"));

        let mut blob = sample_manifest().encode().unwrap().to_vec();
        blob[4] = 0xFF;
        let err = TransitiveAspectsManifest::decode(&blob).unwrap_err();
        assert!(err.to_string().contains("unsupported format version"));
    }

    /// Test decode rejects a corrupted body
    #[test]
    fn test_decode_rejects_corrupt_body() {
        let blob = sample_manifest().encode().unwrap().to_vec();
        let truncated = &blob[..MANIFEST_HEADER_LEN + 3];

        let err = TransitiveAspectsManifest::decode(truncated).unwrap_err();
        assert!(matches!(err, AspectError::Manifest(_)));
    }

    /// Test empty manifest detection
    #[test]
    fn test_is_empty() {
        let empty = TransitiveAspectsManifest::new(AssemblyIdentity::new("A", "1"));
        assert!(empty.is_empty());
        assert_eq!(empty.instance_count(), 0);
        assert!(empty.aspects_of("Acme.Missing").is_empty());

        assert!(!sample_manifest().is_empty());
    }

    /// Test projection bumps the degree and keeps secondaries
    #[test]
    fn test_build_manifest_projection() {
        let arena = AspectInstanceArena::new();
        let class = inheritable_class("Acme.CacheAspect");

        let primary_source = arena.create(
            Arc::clone(&class),
            Arc::new(CacheAspect { seconds: 30 }),
            DeclarationRef::new("T:Acme.Base"),
            1,
            vec![AspectPredecessor::from_attribute(AttributeRef::new(
                "T:Acme.Base",
                2,
            ))],
        );
        primary_source.set_state(serde_json::json!({ "layer": 1 }));
        let duplicate = arena.create(
            Arc::clone(&class),
            Arc::new(CacheAspect { seconds: 60 }),
            DeclarationRef::new("T:Acme.Base"),
            1,
            vec![AspectPredecessor::from_attribute(AttributeRef::new(
                "T:Acme.Base",
                1,
            ))],
        );

        let aggregated = aggregate(&arena, vec![primary_source, duplicate]);
        let manifest = build_manifest(
            &arena,
            AssemblyIdentity::new("Acme.Core", "1.0.0"),
            &[aggregated],
            vec![],
        )
        .unwrap();

        let exported = manifest.aspects_of("Acme.CacheAspect");
        assert_eq!(exported.len(), 1);
        // Source degree 0, stored bumped for the cross-assembly hop.
        assert_eq!(exported[0].degree, 1);
        assert_eq!(exported[0].aspect_payload["seconds"], 30);
        assert_eq!(exported[0].state, Some(serde_json::json!({ "layer": 1 })));
        assert_eq!(exported[0].secondary.len(), 1);
        assert_eq!(exported[0].secondary[0].aspect_payload["seconds"], 60);
    }

    /// Test non-inheritable and skipped aggregates are not exported
    #[test]
    fn test_build_manifest_filters() {
        let arena = AspectInstanceArena::new();

        let plain = Arc::new(AspectClass::builder("Acme.Plain").build().unwrap());
        let not_inheritable = arena.create(
            plain,
            Arc::new(CacheAspect { seconds: 1 }),
            DeclarationRef::new("T:Acme.A"),
            1,
            vec![],
        );

        let class = inheritable_class("Acme.CacheAspect");
        let skipped = arena.create(
            class,
            Arc::new(CacheAspect { seconds: 2 }),
            DeclarationRef::new("T:Acme.B"),
            1,
            vec![],
        );
        skipped.skip();

        let aggregates = vec![
            aggregate(&arena, vec![not_inheritable]),
            aggregate(&arena, vec![skipped]),
        ];
        let manifest = build_manifest(
            &arena,
            AssemblyIdentity::new("Acme.Core", "1.0.0"),
            &aggregates,
            vec![],
        )
        .unwrap();

        assert!(manifest.is_empty());
    }

    /// Test class deserializer rebuilds the aspect from the payload
    #[test]
    fn test_payload_rebuilds_aspect() {
        let class = inheritable_class("Acme.CacheAspect");
        let payload = serde_json::json!({ "seconds": 45 });

        let aspect = class.deserialize_aspect(&payload).unwrap();
        let cache = aspect.as_any().downcast_ref::<CacheAspect>().unwrap();

        assert_eq!(cache.seconds, 45);
    }
}
