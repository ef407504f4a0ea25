//! DTB (Device Tree Blob) reading.
//!
//! A FIT image is a flattened device tree. This module parses the blob into
//! an immutable in-memory tree of [`DtNode`]s. Every offset and length read
//! from the blob is checked against the buffer before use, because the blob
//! is attacker controllable: a malformed image must produce an error, never
//! a panic or an allocation sized by a bogus header field.

use crate::{FitError, Result};

// ---------------------------------------------------------------------------
// DTB constants
// ---------------------------------------------------------------------------

pub const FDT_MAGIC: u32 = 0xd00dfeed;
pub const FDT_BEGIN_NODE: u32 = 0x00000001;
pub const FDT_END_NODE: u32 = 0x00000002;
pub const FDT_PROP: u32 = 0x00000003;
pub const FDT_NOP: u32 = 0x00000004;
pub const FDT_END: u32 = 0x00000009;

// Header field offsets
pub const HDR_MAGIC: usize = 0;
pub const HDR_TOTALSIZE: usize = 4;
pub const HDR_OFF_DT_STRUCT: usize = 8;
pub const HDR_OFF_DT_STRINGS: usize = 12;
pub const HDR_SIZE_DT_STRINGS: usize = 32;
pub const HDR_SIZE_DT_STRUCT: usize = 36;
pub const HDR_SIZE: usize = 40;

/// Deepest node nesting accepted. FIT images use four levels.
pub const MAX_DEPTH: usize = 32;

/// Read a big-endian u32 from a byte slice at the given offset.
pub fn get_u32(data: &[u8], off: usize) -> Option<u32> {
    let end = off.checked_add(4)?;
    let bytes = data.get(off..end)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn header_u32(dtb: &[u8], off: usize) -> Result<usize> {
    get_u32(dtb, off)
        .map(|v| v as usize)
        .ok_or(FitError::TooSmall {
            size: dtb.len(),
            min: HDR_SIZE,
        })
}

/// Validated view of the DTB header: the struct and strings blocks are
/// guaranteed to lie inside the blob.
#[derive(Debug, Clone, Copy)]
pub struct FdtHeader {
    pub totalsize: usize,
    pub off_dt_struct: usize,
    pub size_dt_struct: usize,
    pub off_dt_strings: usize,
    pub size_dt_strings: usize,
}

pub fn fdt_check_header(dtb: &[u8]) -> Result<FdtHeader> {
    if dtb.len() < HDR_SIZE {
        return Err(FitError::TooSmall {
            size: dtb.len(),
            min: HDR_SIZE,
        });
    }
    if header_u32(dtb, HDR_MAGIC)? != FDT_MAGIC as usize {
        return Err(FitError::BadTree("bad DTB magic".into()));
    }
    let hdr = FdtHeader {
        totalsize: header_u32(dtb, HDR_TOTALSIZE)?,
        off_dt_struct: header_u32(dtb, HDR_OFF_DT_STRUCT)?,
        size_dt_struct: header_u32(dtb, HDR_SIZE_DT_STRUCT)?,
        off_dt_strings: header_u32(dtb, HDR_OFF_DT_STRINGS)?,
        size_dt_strings: header_u32(dtb, HDR_SIZE_DT_STRINGS)?,
    };
    if hdr.totalsize > dtb.len() {
        return Err(FitError::TooSmall {
            size: dtb.len(),
            min: hdr.totalsize,
        });
    }
    let block_fits = |off: usize, size: usize| {
        off.checked_add(size)
            .map_or(false, |end| off >= HDR_SIZE && end <= hdr.totalsize)
    };
    if !block_fits(hdr.off_dt_struct, hdr.size_dt_struct) {
        return Err(FitError::BadTree(format!(
            "struct block 0x{:x}+0x{:x} outside blob of {} bytes",
            hdr.off_dt_struct, hdr.size_dt_struct, hdr.totalsize
        )));
    }
    if !block_fits(hdr.off_dt_strings, hdr.size_dt_strings) {
        return Err(FitError::BadTree(format!(
            "strings block 0x{:x}+0x{:x} outside blob of {} bytes",
            hdr.off_dt_strings, hdr.size_dt_strings, hdr.totalsize
        )));
    }
    Ok(hdr)
}

// ---------------------------------------------------------------------------
// In-memory tree
// ---------------------------------------------------------------------------

/// A property in the device tree: name → value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtProperty {
    pub name: String,
    pub value: Vec<u8>,
}

/// A node in the device tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtNode {
    pub name: String,
    pub properties: Vec<DtProperty>,
    pub children: Vec<DtNode>,
}

impl DtNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Raw value of the property `name`.
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_slice())
    }

    /// Property as a string, up to the first NUL.
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(|v| {
            let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
            std::str::from_utf8(&v[..end]).ok()
        })
    }

    pub fn property_u32(&self, name: &str) -> Option<u32> {
        self.property(name).and_then(|v| get_u32(v, 0))
    }

    pub fn child(&self, name: &str) -> Option<&DtNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Follow a `/`-separated path from this node. `"/"` is the node itself.
    pub fn walk(&self, path: &str) -> Option<&DtNode> {
        let mut node = self;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            node = node.child(component)?;
        }
        Some(node)
    }

    /// Direct children for which `predicate` holds, in tree order.
    pub fn children_matching<F>(&self, predicate: F) -> Vec<&DtNode>
    where
        F: Fn(&DtNode) -> bool,
    {
        self.children.iter().filter(|c| predicate(c)).collect()
    }

    /// Every node of this subtree (this node included, depth first) for
    /// which `predicate` holds.
    pub fn find_all<F>(&self, predicate: F) -> Vec<&DtNode>
    where
        F: Fn(&DtNode) -> bool,
    {
        let mut found = Vec::new();
        self.collect_matching(&predicate, &mut found);
        found
    }

    fn collect_matching<'a, F>(&'a self, predicate: &F, found: &mut Vec<&'a DtNode>)
    where
        F: Fn(&DtNode) -> bool,
    {
        if predicate(self) {
            found.push(self);
        }
        for child in &self.children {
            child.collect_matching(predicate, found);
        }
    }

    #[cfg(test)]
    pub fn set_property(&mut self, name: &str, value: Vec<u8>) {
        if let Some(prop) = self.properties.iter_mut().find(|p| p.name == name) {
            prop.value = value;
        } else {
            self.properties.push(DtProperty {
                name: name.to_string(),
                value,
            });
        }
    }

    #[cfg(test)]
    pub fn set_property_str(&mut self, name: &str, val: &str) {
        let mut v = val.as_bytes().to_vec();
        v.push(0);
        self.set_property(name, v);
    }

    #[cfg(test)]
    pub fn with_child(mut self, child: DtNode) -> Self {
        self.children.push(child);
        self
    }
}

// ---------------------------------------------------------------------------
// Parse DTB → tree
// ---------------------------------------------------------------------------

struct Parser<'a> {
    data: &'a [u8],
    strings: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn read_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.end {
            return Err(FitError::BadTree(format!(
                "struct block truncated at offset {}",
                self.pos
            )));
        }
        let v = get_u32(self.data, self.pos)
            .ok_or_else(|| FitError::BadTree("struct block truncated".into()))?;
        self.pos += 4;
        Ok(v)
    }

    fn align(&mut self) {
        self.pos = (self.pos + 3) & !3;
    }

    fn read_string_nul(&mut self) -> Result<String> {
        let start = self.pos;
        let len = self.data[start..self.end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FitError::BadTree(format!("unterminated node name at {start}")))?;
        let s = std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| FitError::BadTree(format!("node name at {start} is not UTF-8")))?
            .to_string();
        self.pos = start + len + 1;
        self.align();
        Ok(s)
    }

    fn get_string(&self, off: usize) -> Result<String> {
        let tail = self
            .strings
            .get(off..)
            .ok_or_else(|| FitError::BadTree(format!("property name offset {off} out of range")))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FitError::BadTree(format!("unterminated property name at {off}")))?;
        std::str::from_utf8(&tail[..len])
            .map(str::to_string)
            .map_err(|_| FitError::BadTree(format!("property name at {off} is not UTF-8")))
    }

    fn parse_node(&mut self, depth: usize) -> Result<DtNode> {
        if depth >= MAX_DEPTH {
            return Err(FitError::BadTree("DTB too deep".into()));
        }
        let name = self.read_string_nul()?;
        let mut node = DtNode::new(&name);

        loop {
            let tag = self.read_u32()?;
            match tag {
                FDT_PROP => {
                    let len = self.read_u32()? as usize;
                    let nameoff = self.read_u32()? as usize;
                    // Check the claimed length before copying anything.
                    if len > self.end - self.pos {
                        return Err(FitError::BadTree(format!(
                            "property of {len} bytes at offset {} overruns struct block",
                            self.pos
                        )));
                    }
                    let prop_name = self.get_string(nameoff)?;
                    let value = self.data[self.pos..self.pos + len].to_vec();
                    self.pos += len;
                    self.align();
                    node.properties.push(DtProperty {
                        name: prop_name,
                        value,
                    });
                }
                FDT_BEGIN_NODE => {
                    node.children.push(self.parse_node(depth + 1)?);
                }
                FDT_END_NODE => return Ok(node),
                FDT_NOP => {}
                _ => {
                    return Err(FitError::BadTree(format!(
                        "unexpected DTB tag 0x{:08x} at offset {}",
                        tag,
                        self.pos - 4
                    )));
                }
            }
        }
    }
}

/// Parse a DTB blob into an in-memory tree.
pub fn parse_dtb(data: &[u8]) -> Result<DtNode> {
    let hdr = fdt_check_header(data)?;
    let mut parser = Parser {
        data,
        strings: &data[hdr.off_dt_strings..hdr.off_dt_strings + hdr.size_dt_strings],
        pos: hdr.off_dt_struct,
        end: hdr.off_dt_struct + hdr.size_dt_struct,
    };
    loop {
        match parser.read_u32()? {
            FDT_NOP => continue,
            FDT_BEGIN_NODE => break,
            tag => {
                return Err(FitError::BadTree(format!(
                    "expected FDT_BEGIN_NODE for root, got 0x{tag:08x}"
                )))
            }
        }
    }
    parser.parse_node(0)
}

// ---------------------------------------------------------------------------
// Serialize tree → DTB (fixture builder)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn serialize_dtb(root: &DtNode) -> Vec<u8> {
    use std::collections::HashMap;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn pad(buf: &mut Vec<u8>) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn node(
        n: &DtNode,
        st: &mut Vec<u8>,
        strings: &mut Vec<u8>,
        map: &mut HashMap<String, u32>,
    ) {
        push_u32(st, FDT_BEGIN_NODE);
        st.extend_from_slice(n.name.as_bytes());
        st.push(0);
        pad(st);
        for p in &n.properties {
            let off = *map.entry(p.name.clone()).or_insert_with(|| {
                let off = strings.len() as u32;
                strings.extend_from_slice(p.name.as_bytes());
                strings.push(0);
                off
            });
            push_u32(st, FDT_PROP);
            push_u32(st, p.value.len() as u32);
            push_u32(st, off);
            st.extend_from_slice(&p.value);
            pad(st);
        }
        for c in &n.children {
            node(c, st, strings, map);
        }
        push_u32(st, FDT_END_NODE);
    }

    let mut st = Vec::new();
    let mut strings = Vec::new();
    let mut map = HashMap::new();
    node(root, &mut st, &mut strings, &mut map);
    push_u32(&mut st, FDT_END);

    let off_mem_rsvmap = HDR_SIZE as u32;
    let off_dt_struct = off_mem_rsvmap + 16;
    let off_dt_strings = off_dt_struct + st.len() as u32;
    let totalsize = off_dt_strings + strings.len() as u32;

    let mut out = Vec::with_capacity(totalsize as usize);
    for v in [
        FDT_MAGIC,
        totalsize,
        off_dt_struct,
        off_dt_strings,
        off_mem_rsvmap,
        17,
        16,
        0,
        strings.len() as u32,
        st.len() as u32,
    ] {
        push_u32(&mut out, v);
    }
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&st);
    out.extend_from_slice(&strings);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_simple_tree() -> DtNode {
        let mut root = DtNode::new("");
        root.set_property_str("compatible", "test");
        root.set_property("#address-cells", 1u32.to_be_bytes().to_vec());
        let mut child = DtNode::new("child");
        child.set_property_str("status", "okay");
        child.set_property("data", vec![1, 2, 3, 4, 5]);
        let mut grandchild = DtNode::new("signature-1");
        grandchild.set_property_str("algo", "sha256,rsa2048");
        root.with_child(child.with_child(grandchild))
    }

    #[test]
    fn test_roundtrip_serialize_parse() {
        let tree = make_simple_tree();
        let parsed = parse_dtb(&serialize_dtb(&tree)).unwrap();
        assert_eq!(parsed, tree);
        assert_eq!(parsed.property_str("compatible"), Some("test"));
        assert_eq!(parsed.property_u32("#address-cells"), Some(1));
        let child = parsed.child("child").unwrap();
        assert_eq!(child.property("data"), Some([1u8, 2, 3, 4, 5].as_slice()));
    }

    #[test]
    fn test_walk_paths() {
        let tree = make_simple_tree();
        assert_eq!(tree.walk("/").unwrap().name, "");
        assert_eq!(tree.walk("/child").unwrap().name, "child");
        assert_eq!(tree.walk("/child/signature-1").unwrap().name, "signature-1");
        assert!(tree.walk("/nonexistent").is_none());
        assert!(tree.walk("/child/nope").is_none());
    }

    #[test]
    fn test_find_all_is_recursive() {
        let tree = make_simple_tree();
        let found = tree.find_all(|n| n.name.starts_with("sig"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "signature-1");
        assert_eq!(tree.children_matching(|n| n.name.starts_with("sig")).len(), 0);
    }

    #[test]
    fn test_rejects_bad_magic_and_short_blobs() {
        assert!(matches!(parse_dtb(&[0u8; 8]), Err(FitError::TooSmall { .. })));
        assert!(matches!(parse_dtb(&[0u8; 64]), Err(FitError::BadTree(_))));
        assert!(parse_dtb(b"/dts-v1/; / { images { }; };").is_err());
    }

    #[test]
    fn test_rejects_truncated_blob() {
        let dtb = serialize_dtb(&make_simple_tree());
        let truncated = &dtb[..dtb.len() - 8];
        assert!(parse_dtb(truncated).is_err());
    }

    #[test]
    fn test_rejects_oversized_property_length() {
        let mut root = DtNode::new("");
        root.set_property("data", vec![0xaa; 8]);
        let mut dtb = serialize_dtb(&root);
        let hdr = fdt_check_header(&dtb).unwrap();
        // root BEGIN_NODE (4) + empty name padded (4) + PROP tag (4) → len
        let len_off = hdr.off_dt_struct + 12;
        dtb[len_off..len_off + 4].copy_from_slice(&0x7fff_ffffu32.to_be_bytes());
        assert!(matches!(parse_dtb(&dtb), Err(FitError::BadTree(_))));
    }

    #[test]
    fn test_rejects_excessive_depth() {
        let mut node = DtNode::new("leaf");
        for i in 0..MAX_DEPTH + 1 {
            node = DtNode::new(&format!("n{i}")).with_child(node);
        }
        let root = DtNode::new("").with_child(node);
        assert!(matches!(parse_dtb(&serialize_dtb(&root)), Err(FitError::BadTree(_))));
    }
}
