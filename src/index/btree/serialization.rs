use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Header layout:
// - is_leaf: u8 (1 byte)
// - key_count: u16 (2 bytes)
// - parent: u32 (4 bytes)
// - next_leaf: u32 (4 bytes)
pub(crate) const NODE_HEADER_SIZE: usize = 11;

/// Serialize a B+Tree node into a page image
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);

    page.data[0] = u8::from(node.is_leaf);
    LittleEndian::write_u16(&mut page.data[1..3], node.keys.len() as u16);
    LittleEndian::write_u32(&mut page.data[3..7], node.parent);
    LittleEndian::write_u32(&mut page.data[7..11], node.next_leaf);

    let mut offset = NODE_HEADER_SIZE;

    // Keys are length-prefixed so variable-width key types work
    for key in &node.keys {
        let key_bytes = bincode::serialize(key)
            .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
        if offset + 2 + key_bytes.len() > PAGE_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut page.data[offset..offset + 2], key_bytes.len() as u16);
        offset += 2;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    if node.is_leaf {
        for value in &node.values {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.page_id);
            offset += 4;
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], value.slot_num);
            offset += 4;
        }
    } else {
        for child in &node.children {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::NodeTooLarge);
            }
            LittleEndian::write_u32(&mut page.data[offset..offset + 4], *child);
            offset += 4;
        }
    }

    Ok(())
}

/// Patch the parent pointer in a serialized node image without decoding
/// the rest of the page
pub(crate) fn write_parent(page: &mut Page, parent: crate::common::types::PageId) {
    LittleEndian::write_u32(&mut page.data[3..7], parent);
}

/// Deserialize a B+Tree node from a page image
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
{
    let is_leaf = match page.data[0] {
        0 => false,
        1 => true,
        _ => return Err(BTreeError::InvalidPageFormat),
    };
    let key_count = LittleEndian::read_u16(&page.data[1..3]) as usize;
    let parent = LittleEndian::read_u32(&page.data[3..7]);
    let next_leaf = LittleEndian::read_u32(&page.data[7..11]);

    let mut offset = NODE_HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        if offset + 2 > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key_len = LittleEndian::read_u16(&page.data[offset..offset + 2]) as usize;
        offset += 2;
        if offset + key_len > PAGE_SIZE {
            return Err(BTreeError::InvalidPageFormat);
        }
        let key = bincode::deserialize(&page.data[offset..offset + key_len])
            .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
        offset += key_len;
        keys.push(key);
    }

    let mut node = BTreeNode {
        is_leaf,
        parent,
        next_leaf,
        keys,
        children: Vec::new(),
        values: Vec::new(),
    };

    if is_leaf {
        node.values.reserve(key_count);
        for _ in 0..key_count {
            if offset + 8 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            let page_id = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            let slot_num = LittleEndian::read_u32(&page.data[offset..offset + 4]);
            offset += 4;
            node.values.push(Rid::new(page_id, slot_num));
        }
    } else {
        let child_count = key_count + 1;
        node.children.reserve(child_count);
        for _ in 0..child_count {
            if offset + 4 > PAGE_SIZE {
                return Err(BTreeError::InvalidPageFormat);
            }
            node.children.push(LittleEndian::read_u32(&page.data[offset..offset + 4]));
            offset += 4;
        }
    }

    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::INVALID_PAGE_ID;

    #[test]
    fn test_leaf_round_trip() {
        let mut node = BTreeNode::<i64>::new_leaf(3);
        node.next_leaf = 9;
        for i in 0..20 {
            node.keys.push(i * 7);
            node.values.push(Rid::new(i as u32, (i * 2) as u32));
        }

        let mut page = Page::new(5);
        serialize_node(&node, &mut page).unwrap();
        let decoded: BTreeNode<i64> = deserialize_node(&page).unwrap();

        assert!(decoded.is_leaf);
        assert_eq!(decoded.parent, 3);
        assert_eq!(decoded.next_leaf, 9);
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.values, node.values);
    }

    #[test]
    fn test_internal_round_trip() {
        let mut node = BTreeNode::<String>::new_internal(INVALID_PAGE_ID);
        node.keys = vec!["apple".to_string(), "mango".to_string()];
        node.children = vec![2, 4, 6];

        let mut page = Page::new(7);
        serialize_node(&node, &mut page).unwrap();
        let decoded: BTreeNode<String> = deserialize_node(&page).unwrap();

        assert!(!decoded.is_leaf);
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.children, node.children);
    }

    #[test]
    fn test_oversized_node_is_rejected() {
        let mut node = BTreeNode::<String>::new_leaf(INVALID_PAGE_ID);
        // a single key larger than the page can hold
        node.keys.push("x".repeat(PAGE_SIZE));
        node.values.push(Rid::new(1, 1));

        let mut page = Page::new(3);
        assert!(matches!(
            serialize_node(&node, &mut page),
            Err(BTreeError::NodeTooLarge)
        ));
    }
}
