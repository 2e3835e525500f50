//! Tar header normalization.
//!
//! Node identity is the hash of a canonical serialization of the entry's
//! significant metadata concatenated with its content hash. Two files
//! with identical payloads but different mode/ownership/xattrs must get
//! distinct identities, while incidental writer artifacts (entry name,
//! long-name extension records, sub-second timestamps) must not
//! contribute: the writer regenerates those deterministically.

use std::collections::BTreeMap;

use tar::EntryType;

/// Extended (PAX) records attached to an entry, keyed by record name.
/// The map keeps keys sorted, which is what makes the serialization of
/// the records canonical.
pub type PaxRecords = BTreeMap<String, Vec<u8>>;

/// PAX keys that the tar writer (re)generates itself and which therefore
/// carry no identity: path/linkpath long-name extensions, size overflow,
/// and timestamps (times are rounded to whole seconds in the ustar
/// block).
const WRITER_GENERATED: &[&str] = &["path", "linkpath", "size", "mtime", "atime", "ctime"];

/// Drop the writer-generated records, keeping only caller-significant
/// ones (xattrs and other user records) for emission and identity.
pub(crate) fn strip_writer_records(pax: &PaxRecords) -> PaxRecords {
    pax.iter()
        .filter(|(k, _)| !WRITER_GENERATED.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Serialize one PAX record: `"<len> <key>=<value>\n"` where `<len>` is
/// the total record length including itself.
pub(crate) fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    // 3 = space, '=', '\n'
    let base = key.len() + value.len() + 3;
    let mut len = base + base.to_string().len();
    // The length field's own width can push the total over a digit
    // boundary (e.g. 99 -> 101).
    if len.to_string().len() != base.to_string().len() {
        len = base + len.to_string().len();
    }
    let mut out = format!("{len} {key}=").into_bytes();
    out.extend_from_slice(value);
    out.push(b'\n');
    out
}

/// Produce the canonical byte serialization of a header for identity
/// hashing: a normalized 512-byte ustar block followed by the sorted
/// caller-significant PAX records.
pub(crate) fn normalized_header_bytes(header: &tar::Header, pax: &PaxRecords) -> Vec<u8> {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(header.entry_type());
    h.set_size(header.size().unwrap_or(0));
    h.set_mode(header.mode().unwrap_or(0));
    h.set_uid(header.uid().unwrap_or(0));
    h.set_gid(header.gid().unwrap_or(0));
    // Whole seconds only; PAX sub-second records are excluded below.
    h.set_mtime(header.mtime().unwrap_or(0));
    // The entry name never contributes: identity is path independent.
    // The link name only matters for link types.
    if matches!(header.entry_type(), EntryType::Link | EntryType::Symlink) {
        if let Ok(Some(link)) = header.link_name() {
            // Long link names spill into a PAX linkpath record, which is
            // writer generated; the truncated ustar field is still a
            // stable function of the target.
            let _ = h.set_link_name_literal(&*link.to_string_lossy());
        }
    }
    if matches!(header.entry_type(), EntryType::Char | EntryType::Block) {
        if let (Ok(Some(major)), Ok(Some(minor))) =
            (header.device_major(), header.device_minor())
        {
            let _ = h.set_device_major(major);
            let _ = h.set_device_minor(minor);
        }
    }
    h.set_cksum();

    let mut out = h.as_bytes().to_vec();
    for (key, value) in pax {
        if WRITER_GENERATED.contains(&key.as_str()) {
            continue;
        }
        out.extend_from_slice(&pax_record(key, value));
    }
    out
}

/// Whether a header + PAX record set is "blob shaped": a regular file
/// with the canonical CAS metadata (mode rwxr-xr-x, zero owner and
/// time, no extended records). Such entries dedup purely by content.
pub(crate) fn is_blob_shaped(header: &tar::Header, pax: &PaxRecords) -> bool {
    if !matches!(
        header.entry_type(),
        EntryType::Regular | EntryType::Continuous
    ) {
        return false;
    }
    let plain_owner = header.uid() == Ok(0)
        && header.gid() == Ok(0)
        && header.username() == Ok(Some(""))
        && header.groupname() == Ok(Some(""));
    header.mode() == Ok(0o755)
        && plain_owner
        && header.mtime() == Ok(0)
        && pax.iter().all(|(k, _)| WRITER_GENERATED.contains(&k.as_str()))
}

/// The canonical header for a blob entry of the given size.
pub(crate) fn blob_header(size: u64) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(EntryType::Regular);
    h.set_size(size);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h
}

/// The canonical header for a directory entry owned by the CAS (tree
/// roots and their subdirectories).
pub(crate) fn cas_dir_header() -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(EntryType::Directory);
    h.set_size(0);
    h.set_mode(0o755);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h
}

/// The header used for hardlink materializations of user-visible paths;
/// the metadata that matters lives on the link target.
pub(crate) fn hardlink_header() -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(EntryType::Link);
    h.set_size(0);
    h.set_mode(0o644);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mtime(0);
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pax_record_length_field() {
        let r = pax_record("mtime", b"123.456");
        // The length field names the total record length, itself included.
        let s = String::from_utf8(r.clone()).unwrap();
        let (len, _) = s.split_once(' ').unwrap();
        assert_eq!(len.parse::<usize>().unwrap(), r.len());
    }

    #[test]
    fn test_pax_record_length_boundary() {
        // A payload engineered so the record crosses a digit boundary
        // when the length field itself is accounted for.
        for pad in 80..120 {
            let value = vec![b'v'; pad];
            let r = pax_record("k", &value);
            let s = String::from_utf8_lossy(&r);
            let (len, _) = s.split_once(' ').unwrap();
            assert_eq!(len.parse::<usize>().unwrap(), r.len(), "pad={pad}");
        }
    }

    #[test]
    fn test_normalization_ignores_name() {
        let mut a = tar::Header::new_gnu();
        a.set_entry_type(EntryType::Regular);
        a.set_size(3);
        a.set_mode(0o600);
        a.set_path("some/path").unwrap();
        let mut b = tar::Header::new_ustar();
        b.set_entry_type(EntryType::Regular);
        b.set_size(3);
        b.set_mode(0o600);
        b.set_path("other/path").unwrap();
        let empty = PaxRecords::new();
        assert_eq!(
            normalized_header_bytes(&a, &empty),
            normalized_header_bytes(&b, &empty)
        );
    }

    #[test]
    fn test_normalization_distinguishes_mode_and_xattrs() {
        let mut a = tar::Header::new_ustar();
        a.set_entry_type(EntryType::Regular);
        a.set_size(3);
        a.set_mode(0o600);
        let mut b = a.clone();
        b.set_mode(0o640);
        let empty = PaxRecords::new();
        assert_ne!(
            normalized_header_bytes(&a, &empty),
            normalized_header_bytes(&b, &empty)
        );

        let mut xattrs = PaxRecords::new();
        xattrs.insert("SCHILY.xattr.user.foo".into(), b"bar".to_vec());
        assert_ne!(
            normalized_header_bytes(&a, &empty),
            normalized_header_bytes(&a, &xattrs)
        );
    }

    #[test]
    fn test_normalization_ignores_writer_records() {
        let a = {
            let mut h = tar::Header::new_ustar();
            h.set_entry_type(EntryType::Regular);
            h.set_size(3);
            h
        };
        let empty = PaxRecords::new();
        let mut writer_only = PaxRecords::new();
        writer_only.insert("path".into(), b"very/long/path".to_vec());
        writer_only.insert("mtime".into(), b"1.5".to_vec());
        assert_eq!(
            normalized_header_bytes(&a, &empty),
            normalized_header_bytes(&a, &writer_only)
        );
    }

    #[test]
    fn test_blob_shape() {
        let empty = PaxRecords::new();
        assert!(is_blob_shaped(&blob_header(3), &empty));
        let mut h = blob_header(3);
        h.set_mode(0o644);
        assert!(!is_blob_shaped(&h, &empty));
        let mut h = blob_header(3);
        h.set_mtime(1);
        assert!(!is_blob_shaped(&h, &empty));
        let mut h = blob_header(3);
        h.set_uid(1000);
        assert!(!is_blob_shaped(&h, &empty));
        let mut xattrs = PaxRecords::new();
        xattrs.insert("SCHILY.xattr.user.foo".into(), b"bar".to_vec());
        assert!(!is_blob_shaped(&blob_header(3), &xattrs));
        assert!(!is_blob_shaped(&cas_dir_header(), &empty));
    }
}
