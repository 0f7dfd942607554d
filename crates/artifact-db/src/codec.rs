//! Binary snapshot format for [`PackageDb`].
//!
//! Layout (format version 1):
//!
//! ```text
//! u8       format version
//! i64 u32  last update (unix seconds, nanoseconds)
//! varint   database version
//! varint   type count      { name*, installable, has-context, context# }
//! varint   instance count  { type*, name, version, savors?, registered at,
//!                            varint ref count { target index, kind, savors? } }
//! varint   feed count      { type*, name, varint member count { index } }
//! ```
//!
//! `*` marks strings written through the string pool and `#` savor contexts
//! written through the context pool: the first occurrence writes `0` followed
//! by the content, later occurrences write `index + 1`. Pools are local to
//! one encode or decode pass, so indices are positional and the write order
//! must never change.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;

use crate::artifact::{Artifact, ArtifactInstance, ArtifactType, ArtifactTypeRegistry};
use crate::db::PackageDb;
use crate::error::CodecError;
use crate::feed::PackageFeed;
use crate::instance::{DependencyKind, PackageInstance, PackageReference};
use crate::savor::{SavorContext, Savors};
use crate::store::InstanceStore;

/// Current binary format version.
pub const FORMAT_VERSION: u8 = 1;

type CodecResult<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------------
// Primitive stream helpers
// ---------------------------------------------------------------------------

struct Writer<W: Write> {
    inner: W,
}

impl<W: Write> Writer<W> {
    fn u8(&mut self, v: u8) -> CodecResult<()> {
        self.inner.write_all(&[v])?;
        Ok(())
    }

    fn bool(&mut self, v: bool) -> CodecResult<()> {
        self.u8(u8::from(v))
    }

    fn varint(&mut self, mut v: u64) -> CodecResult<()> {
        while v >= 0x80 {
            self.u8((v as u8) | 0x80)?;
            v >>= 7;
        }
        self.u8(v as u8)
    }

    fn usize(&mut self, v: usize) -> CodecResult<()> {
        self.varint(v as u64)
    }

    fn str(&mut self, s: &str) -> CodecResult<()> {
        self.usize(s.len())?;
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    fn timestamp(&mut self, ts: DateTime<Utc>) -> CodecResult<()> {
        self.inner.write_all(&ts.timestamp().to_le_bytes())?;
        self.inner
            .write_all(&ts.timestamp_subsec_nanos().to_le_bytes())?;
        Ok(())
    }
}

struct Reader<R: Read> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn u8(&mut self) -> CodecResult<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn bool(&mut self) -> CodecResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(CodecError::Corrupted(format!("invalid boolean byte {b}"))),
        }
    }

    fn varint(&mut self) -> CodecResult<u64> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let b = self.u8()?;
            if shift > 63 {
                return Err(CodecError::Corrupted("varint overflow".to_string()));
            }
            result |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn usize(&mut self) -> CodecResult<usize> {
        usize::try_from(self.varint()?)
            .map_err(|_| CodecError::Corrupted("length does not fit in memory".to_string()))
    }

    fn str(&mut self) -> CodecResult<String> {
        let len = self.usize()?;
        let mut buf = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(CodecError::Corrupted("truncated string".to_string()));
        }
        String::from_utf8(buf).map_err(|e| CodecError::Corrupted(e.to_string()))
    }

    fn timestamp(&mut self) -> CodecResult<DateTime<Utc>> {
        let mut secs = [0u8; 8];
        self.inner.read_exact(&mut secs)?;
        let mut nanos = [0u8; 4];
        self.inner.read_exact(&mut nanos)?;
        DateTime::from_timestamp(i64::from_le_bytes(secs), u32::from_le_bytes(nanos))
            .ok_or_else(|| CodecError::Corrupted("timestamp out of range".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Object pools
// ---------------------------------------------------------------------------

/// First-write-wins pool: assigns positional indices in order of first sight.
struct WritePool<K> {
    seen: HashMap<K, u64>,
}

impl<K: Eq + Hash> WritePool<K> {
    fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    fn write<W: Write>(
        &mut self,
        w: &mut Writer<W>,
        key: K,
        content: impl FnOnce(&mut Writer<W>) -> CodecResult<()>,
    ) -> CodecResult<()> {
        if let Some(index) = self.seen.get(&key) {
            return w.varint(index + 1);
        }
        w.varint(0)?;
        content(w)?;
        let index = self.seen.len() as u64;
        self.seen.insert(key, index);
        Ok(())
    }
}

/// Read-side mirror of [`WritePool`].
struct ReadPool<T> {
    items: Vec<T>,
}

impl<T: Clone> ReadPool<T> {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn read<R: Read>(
        &mut self,
        r: &mut Reader<R>,
        content: impl FnOnce(&mut Reader<R>) -> CodecResult<T>,
    ) -> CodecResult<T> {
        match r.varint()? {
            0 => {
                let item = content(r)?;
                self.items.push(item.clone());
                Ok(item)
            }
            back => self
                .items
                .get((back - 1) as usize)
                .cloned()
                .ok_or_else(|| CodecError::Corrupted(format!("dangling pool reference {back}"))),
        }
    }
}

struct WritePools {
    strings: WritePool<String>,
    contexts: WritePool<SavorContext>,
}

impl WritePools {
    fn string<W: Write>(&mut self, w: &mut Writer<W>, s: &str) -> CodecResult<()> {
        self.strings.write(w, s.to_string(), |w| w.str(s))
    }

    fn context<W: Write>(&mut self, w: &mut Writer<W>, ctx: &SavorContext) -> CodecResult<()> {
        let Self { strings, contexts } = self;
        contexts.write(w, ctx.clone(), |w| {
            w.str(ctx.name())?;
            w.varint(u64::from(u32::from(ctx.separator())))?;
            let values: Vec<&str> = ctx.values().collect();
            w.usize(values.len())?;
            for v in values {
                strings.write(w, v.to_string(), |w| w.str(v))?;
            }
            Ok(())
        })
    }

    fn savors<W: Write>(&mut self, w: &mut Writer<W>, savors: Option<&Savors>) -> CodecResult<()> {
        match savors {
            None => w.bool(false),
            Some(s) => {
                w.bool(true)?;
                self.context(w, s.context())?;
                self.string(w, &s.to_string())
            }
        }
    }
}

struct ReadPools {
    strings: ReadPool<String>,
    contexts: ReadPool<Arc<SavorContext>>,
}

impl ReadPools {
    fn string<R: Read>(&mut self, r: &mut Reader<R>) -> CodecResult<String> {
        self.strings.read(r, |r| r.str())
    }

    fn context<R: Read>(&mut self, r: &mut Reader<R>) -> CodecResult<Arc<SavorContext>> {
        let Self { strings, contexts } = self;
        contexts.read(r, |r| {
            let name = r.str()?;
            let separator = u32::try_from(r.varint()?)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| CodecError::Corrupted("invalid savor separator".to_string()))?;
            let count = r.usize()?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(strings.read(r, |r| r.str())?);
            }
            Ok(Arc::new(SavorContext::new(name, separator, values)))
        })
    }

    fn savors<R: Read>(&mut self, r: &mut Reader<R>) -> CodecResult<Option<Savors>> {
        if !r.bool()? {
            return Ok(None);
        }
        let ctx = self.context(r)?;
        let text = self.string(r)?;
        ctx.parse(&text)
            .map(Some)
            .map_err(|e| CodecError::Corrupted(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Write `db` to `out` in the current format.
pub fn write_db<W: Write>(db: &PackageDb, out: W) -> Result<(), CodecError> {
    let mut w = Writer { inner: out };
    let mut pools = WritePools {
        strings: WritePool::new(),
        contexts: WritePool::new(),
    };

    w.u8(FORMAT_VERSION)?;
    w.timestamp(db.last_update())?;
    w.varint(db.version())?;

    let mut types: BTreeMap<&str, &ArtifactType> = BTreeMap::new();
    for p in db.instances().iter() {
        if let Some(t) = p.key().artifact().artifact_type() {
            types.insert(t.name(), t);
        }
    }
    for f in db.feeds() {
        if let Some(t) = f.artifact_type() {
            types.insert(t.name(), t);
        }
    }
    w.usize(types.len())?;
    for t in types.values() {
        pools.string(&mut w, t.name())?;
        w.bool(t.is_installable())?;
        match t.savor_context() {
            Some(ctx) => {
                w.bool(true)?;
                pools.context(&mut w, ctx)?;
            }
            None => w.bool(false)?,
        }
    }

    let store = db.instances();
    w.usize(store.len())?;
    for p in store.iter() {
        write_key(&mut w, &mut pools, p.key())?;
        pools.savors(&mut w, p.savors())?;
        w.timestamp(p.registered_at())?;
        w.usize(p.dependencies().len())?;
        for d in p.dependencies() {
            let index = store.index_of(d.target().key()).map_err(|_| {
                CodecError::Corrupted(format!("dangling dependency {}", d.target().key()))
            })?;
            w.usize(index)?;
            w.u8(d.kind().as_u8())?;
            pools.savors(&mut w, d.savors())?;
        }
    }

    w.usize(db.feed_count())?;
    for f in db.feeds() {
        let type_name = f.artifact_type().map(|t| t.name()).unwrap_or_default();
        pools.string(&mut w, type_name)?;
        w.str(f.name())?;
        w.usize(f.len())?;
        for p in f.instances() {
            let index = store.index_of(p.key()).map_err(|_| {
                CodecError::Corrupted(format!("feed member {} not stored", p.key()))
            })?;
            w.usize(index)?;
        }
    }
    w.inner.flush()?;
    Ok(())
}

fn write_key<W: Write>(
    w: &mut Writer<W>,
    pools: &mut WritePools,
    key: &ArtifactInstance,
) -> CodecResult<()> {
    let type_name = key
        .artifact()
        .artifact_type()
        .map(|t| t.name())
        .unwrap_or_default();
    pools.string(w, type_name)?;
    w.str(key.artifact().name())?;
    let version = key.version().map(ToString::to_string).unwrap_or_default();
    w.str(&version)
}

/// Encode `db` into a byte vector.
pub fn to_bytes(db: &PackageDb) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    write_db(db, &mut buf)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

struct RawReference {
    target: usize,
    kind: DependencyKind,
    savors: Option<Savors>,
}

struct RawInstance {
    key: ArtifactInstance,
    savors: Option<Savors>,
    registered_at: DateTime<Utc>,
    references: Vec<RawReference>,
}

/// Read a snapshot written by [`write_db`], registering the artifact types it
/// declares into `registry`.
pub fn read_db<R: Read>(
    registry: &ArtifactTypeRegistry,
    input: R,
) -> Result<PackageDb, CodecError> {
    let mut r = Reader { inner: input };
    let mut pools = ReadPools {
        strings: ReadPool::new(),
        contexts: ReadPool::new(),
    };

    let format = r.u8()?;
    if format != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(format));
    }
    let last_update = r.timestamp()?;
    let version = r.varint()?;

    let type_count = r.usize()?;
    let mut types: HashMap<String, ArtifactType> = HashMap::new();
    for _ in 0..type_count {
        let name = pools.string(&mut r)?;
        let installable = r.bool()?;
        let context = if r.bool()? {
            Some((*pools.context(&mut r)?).clone())
        } else {
            None
        };
        let t = registry.register(&name, installable, context)?;
        types.insert(name, t);
    }
    let lookup_type = |name: &str| {
        types
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::Corrupted(format!("undeclared artifact type '{name}'")))
    };

    let count = r.usize()?;
    let mut raws = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let type_name = pools.string(&mut r)?;
        let name = r.str()?;
        let version_text = r.str()?;
        let version = Version::parse(&version_text)
            .map_err(|e| CodecError::Corrupted(format!("bad version '{version_text}': {e}")))?;
        let key = ArtifactInstance::new(Artifact::new(lookup_type(&type_name)?, name), version);
        let savors = pools.savors(&mut r)?;
        let registered_at = r.timestamp()?;
        let ref_count = r.usize()?;
        let mut references = Vec::with_capacity(ref_count.min(1024));
        for _ in 0..ref_count {
            let target = r.usize()?;
            let kind_byte = r.u8()?;
            let kind = DependencyKind::from_u8(kind_byte)
                .ok_or_else(|| CodecError::Corrupted(format!("bad dependency kind {kind_byte}")))?;
            let savors = pools.savors(&mut r)?;
            references.push(RawReference {
                target,
                kind,
                savors,
            });
        }
        raws.push(RawInstance {
            key,
            savors,
            registered_at,
            references,
        });
    }
    if !raws.windows(2).all(|w| w[0].key < w[1].key) {
        return Err(CodecError::Corrupted(
            "instances are not in key order".to_string(),
        ));
    }

    let instances = build_instances(&raws)?;
    let store = InstanceStore::from_sorted(instances);

    let feed_count = r.usize()?;
    let mut feeds = BTreeMap::new();
    for _ in 0..feed_count {
        let type_name = pools.string(&mut r)?;
        let id = Artifact::new(lookup_type(&type_name)?, r.str()?);
        let member_count = r.usize()?;
        let mut members = Vec::with_capacity(member_count.min(1 << 16));
        for _ in 0..member_count {
            let index = r.usize()?;
            let p = store.get(index).ok_or_else(|| {
                CodecError::Corrupted(format!("feed member index {index} out of range"))
            })?;
            members.push(Arc::clone(p));
        }
        let feed = PackageFeed::new(id.clone()).with_instances(members);
        feeds.insert(id, Arc::new(feed));
    }

    Ok(PackageDb::from_parts(store, feeds, last_update, version))
}

/// Build every instance after its dependency targets.
///
/// Iterative depth-first walk: a frame is pushed for each unbuilt target and
/// the instance is created once all of its targets are built.
fn build_instances(raws: &[RawInstance]) -> CodecResult<Vec<Arc<PackageInstance>>> {
    let mut built: Vec<Option<Arc<PackageInstance>>> = vec![None; raws.len()];
    let mut on_stack = vec![false; raws.len()];
    for root in 0..raws.len() {
        if built[root].is_some() {
            continue;
        }
        let mut stack = vec![root];
        on_stack[root] = true;
        while let Some(&i) = stack.last() {
            let raw = &raws[i];
            let mut pending = None;
            for reference in &raw.references {
                let target = reference.target;
                if target >= raws.len() {
                    return Err(CodecError::Corrupted(format!(
                        "dependency index {target} out of range"
                    )));
                }
                if built[target].is_some() {
                    continue;
                }
                if on_stack[target] {
                    return Err(CodecError::Corrupted(format!(
                        "dependency cycle through {}",
                        raws[target].key
                    )));
                }
                pending = Some(target);
                break;
            }
            if let Some(target) = pending {
                on_stack[target] = true;
                stack.push(target);
                continue;
            }
            let mut dependencies = Vec::with_capacity(raw.references.len());
            for reference in &raw.references {
                let target = built[reference.target].clone().ok_or_else(|| {
                    CodecError::Corrupted(format!("instance {} not built", reference.target))
                })?;
                dependencies.push(PackageReference::new(
                    target,
                    reference.kind,
                    reference.savors.clone(),
                ));
            }
            built[i] = Some(Arc::new(PackageInstance::new(
                raw.key.clone(),
                raw.savors.clone(),
                raw.registered_at,
                dependencies,
            )));
            on_stack[i] = false;
            stack.pop();
        }
    }
    Ok(built.into_iter().flatten().collect())
}

/// Decode a snapshot from bytes.
pub fn from_bytes(
    registry: &ArtifactTypeRegistry,
    bytes: &[u8],
) -> Result<PackageDb, CodecError> {
    read_db(registry, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PackageInstanceInfo;

    #[test]
    fn varint_round_trips_boundaries() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            Writer { inner: &mut buf }.varint(v).unwrap();
            let back = Reader { inner: buf.as_slice() }.varint().unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn string_pool_writes_back_references() {
        let mut buf = Vec::new();
        let mut w = Writer { inner: &mut buf };
        let mut pool = WritePool::new();
        for s in ["NuGet", "NPM", "NuGet"] {
            pool.write(&mut w, s.to_string(), |w| w.str(s)).unwrap();
        }
        // 0 + "NuGet", 0 + "NPM", then back-reference 1.
        assert_eq!(buf.last(), Some(&1));

        let mut r = Reader { inner: buf.as_slice() };
        let mut read = ReadPool::new();
        let got: Vec<String> = (0..3)
            .map(|_| read.read(&mut r, |r| r.str()).unwrap())
            .collect();
        assert_eq!(got, vec!["NuGet", "NPM", "NuGet"]);
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let r = ArtifactTypeRegistry::new();
        let err = from_bytes(&r, &[42]).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(42)));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let types = ArtifactTypeRegistry::new();
        types.register("NuGet", true, None).unwrap();
        let key = ArtifactInstance::try_parse(&types, "NuGet:A/1.0.0");
        let db = PackageDb::empty()
            .add(&types, &[PackageInstanceInfo::new(key)], false)
            .unwrap();
        let bytes = to_bytes(&db).unwrap();
        let fresh = ArtifactTypeRegistry::new();
        assert!(from_bytes(&fresh, &bytes[..bytes.len() - 3]).is_err());
    }

    fn raw_chain(types: &ArtifactTypeRegistry, len: usize) -> Vec<RawInstance> {
        (0..len)
            .map(|i| RawInstance {
                key: ArtifactInstance::try_parse(types, &format!("NuGet:Lib{i:06}/1.0.0")),
                savors: None,
                registered_at: Utc::now(),
                references: (i + 1 < len)
                    .then(|| RawReference {
                        target: i + 1,
                        kind: DependencyKind::Transitive,
                        savors: None,
                    })
                    .into_iter()
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn deep_dependency_chain_is_rebuilt_without_recursion() {
        let types = ArtifactTypeRegistry::new();
        types.register("NuGet", true, None).unwrap();
        let raws = raw_chain(&types, 50_000);
        let built = build_instances(&raws).unwrap();
        assert_eq!(built.len(), 50_000);
        let first = &built[0];
        assert!(Arc::ptr_eq(first.dependencies()[0].target(), &built[1]));
        assert!(built[49_999].dependencies().is_empty());
    }

    #[test]
    fn dependency_cycle_and_dangling_index_are_corrupted() {
        let types = ArtifactTypeRegistry::new();
        types.register("NuGet", true, None).unwrap();

        let mut cyclic = raw_chain(&types, 3);
        cyclic[2].references.push(RawReference {
            target: 0,
            kind: DependencyKind::Transitive,
            savors: None,
        });
        let err = build_instances(&cyclic).unwrap_err();
        assert!(matches!(&err, CodecError::Corrupted(m) if m.contains("cycle")));

        let mut dangling = raw_chain(&types, 2);
        dangling[1].references.push(RawReference {
            target: 7,
            kind: DependencyKind::Transitive,
            savors: None,
        });
        let err = build_instances(&dangling).unwrap_err();
        assert!(matches!(&err, CodecError::Corrupted(m) if m.contains("out of range")));
    }
}
