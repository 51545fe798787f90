/*
    This file is part of tensorpc.

    tensorpc is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.
*/

//! Tensor-tree packing and unpacking.
//!
//! A [`Tree`] is the in-memory shape of a call's payload: nested lists and
//! string-keyed maps bottoming out in [`Array`] leaves. [`pack`] flattens a
//! tree into a `meta` frame (msgpack-encoded structure, dtypes and shapes)
//! plus one raw buffer per leaf, in depth-first order; [`unpack`] is its
//! exact inverse.
//!
//! Leaves are opaque: this module never interprets `data` numerically, only
//! checks that its length agrees with `dtype`/`shape`. Stacking/splitting
//! for batching (see [`crate::batch`]) works the same way, by concatenating
//! or slicing the raw buffer, which is valid precisely because a leaf is
//! required to be C-contiguous.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A contiguous n-dimensional array: a dtype string (e.g. `"<f4"`, following
/// numpy's little/big-endian prefix convention), a shape of non-negative
/// extents, and a raw C-contiguous buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Array {
    /// Dtype string, e.g. `"<f4"` or `">i8"`.
    pub dtype: String,
    /// Shape, outermost axis first.
    pub shape: Vec<usize>,
    /// Raw buffer, exactly `shape.product() * itemsize(dtype)` bytes.
    pub data: Bytes,
}

impl Array {
    /// Build an array, rejecting the object dtype up front.
    pub fn new(dtype: impl Into<String>, shape: Vec<usize>, data: Bytes) -> Result<Self, CodecError> {
        let dtype = dtype.into();
        if dtype == "object" || dtype == "O" {
            return Err(CodecError::ObjectDtype(dtype));
        }
        Ok(Array { dtype, shape, data })
    }

    fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A tree of nested lists/maps bottoming out in [`Array`] leaves. This is
/// the payload shape that [`pack`]/[`unpack`] operate on.
#[derive(Clone, Debug, PartialEq)]
pub enum Tree {
    /// A single array.
    Leaf(Array),
    /// An ordered list of subtrees.
    List(Vec<Tree>),
    /// A string-keyed map of subtrees, iterated in sorted key order so that
    /// flattening is deterministic without needing to carry key order in
    /// the structure descriptor.
    Map(BTreeMap<String, Tree>),
}

/// The shape of a [`Tree`] with leaves erased, used as the `structure`
/// field of the packed meta tuple.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum Shape {
    Leaf,
    List(Vec<Shape>),
    Map(Vec<(String, Shape)>),
}

#[derive(Serialize, Deserialize)]
struct Meta {
    structure: Shape,
    dtypes: Vec<String>,
    shapes: Vec<Vec<usize>>,
}

fn flatten(tree: &Tree, leaves: &mut Vec<&Array>) -> Shape {
    match tree {
        Tree::Leaf(array) => {
            leaves.push(array);
            Shape::Leaf
        }
        Tree::List(items) => Shape::List(items.iter().map(|t| flatten(t, leaves)).collect()),
        Tree::Map(fields) => Shape::Map(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), flatten(v, leaves)))
                .collect(),
        ),
    }
}

fn unflatten(shape: &Shape, leaves: &mut std::vec::IntoIter<Array>) -> Result<Tree, CodecError> {
    match shape {
        Shape::Leaf => Ok(Tree::Leaf(leaves.next().ok_or(CodecError::EmptyPayload)?)),
        Shape::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unflatten(item, leaves)?);
            }
            Ok(Tree::List(out))
        }
        Shape::Map(fields) => {
            let mut out = BTreeMap::new();
            for (key, sub) in fields {
                out.insert(key.clone(), unflatten(sub, leaves)?);
            }
            Ok(Tree::Map(out))
        }
    }
}

/// Flatten `tree` into wire frames: `[meta, buf_0, buf_1, ...]` in leaf
/// order. Fails if any leaf carries an object dtype or a buffer whose
/// length disagrees with its declared shape/dtype.
pub fn pack(tree: &Tree) -> Result<Vec<Bytes>, CodecError> {
    let mut leaves = Vec::new();
    let structure = flatten(tree, &mut leaves);

    let mut dtypes = Vec::with_capacity(leaves.len());
    let mut shapes = Vec::with_capacity(leaves.len());
    let mut buffers = Vec::with_capacity(leaves.len());
    for array in &leaves {
        let expected = array.element_count() * itemsize(&array.dtype);
        if array.data.len() != expected {
            return Err(CodecError::LengthMismatch {
                dtype: array.dtype.clone(),
                shape: array.shape.clone(),
                data_len: array.data.len(),
            });
        }
        dtypes.push(array.dtype.clone());
        shapes.push(array.shape.clone());
        buffers.push(array.data.clone());
    }

    let meta = Meta { structure, dtypes, shapes };
    let mut frames = Vec::with_capacity(1 + buffers.len());
    frames.push(Bytes::from(rmp_serde::to_vec(&meta)?));
    frames.extend(buffers);
    Ok(frames)
}

/// Reconstruct a [`Tree`] from the frames produced by [`pack`]. Buffer
/// memory is shared with `payload` rather than copied, via [`Bytes`]'
/// reference counting.
pub fn unpack(payload: &[Bytes]) -> Result<Tree, CodecError> {
    let (meta_frame, buffers) = payload.split_first().ok_or(CodecError::EmptyPayload)?;
    let meta: Meta = rmp_serde::from_slice(meta_frame)?;

    if meta.dtypes.len() != buffers.len() || meta.shapes.len() != buffers.len() {
        return Err(CodecError::LengthMismatch {
            dtype: meta.dtypes.get(0).cloned().unwrap_or_default(),
            shape: meta.shapes.get(0).cloned().unwrap_or_default(),
            data_len: buffers.len(),
        });
    }

    let mut leaves = Vec::with_capacity(buffers.len());
    for ((dtype, shape), data) in meta.dtypes.into_iter().zip(meta.shapes).zip(buffers) {
        leaves.push(Array::new(dtype, shape, data.clone())?);
    }

    let mut iter = leaves.into_iter();
    unflatten(&meta.structure, &mut iter)
}

/// Byte width of a numpy-style dtype string (`"<f4"`, `">i8"`, `"|u1"`, ...).
/// Panics are avoided: unknown dtypes are treated as 1-byte opaque data so
/// that arbitrary byte blobs can still round-trip.
fn itemsize(dtype: &str) -> usize {
    let digits: String = dtype.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    digits.chars().rev().collect::<String>().parse().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(dtype: &str, shape: Vec<usize>, bytes: Vec<u8>) -> Tree {
        Tree::Leaf(Array::new(dtype, shape, Bytes::from(bytes)).unwrap())
    }

    #[test]
    fn pack_unpack_roundtrip_map() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), leaf("<i4", vec![3], vec![1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]));
        let tree = Tree::Map(fields);

        let packed = pack(&tree).unwrap();
        assert_eq!(packed.len(), 2); // meta + one leaf
        let roundtripped = unpack(&packed).unwrap();
        assert_eq!(tree, roundtripped);
    }

    #[test]
    fn pack_unpack_roundtrip_nested_list() {
        let tree = Tree::List(vec![
            leaf("<f4", vec![2], vec![0; 8]),
            leaf("<f4", vec![2], vec![1; 8]),
        ]);
        let packed = pack(&tree).unwrap();
        assert_eq!(packed.len(), 3);
        assert_eq!(unpack(&packed).unwrap(), tree);
    }

    #[test]
    fn pack_rejects_object_dtype() {
        let err = Array::new("object", vec![1], Bytes::from(vec![0u8])).unwrap_err();
        assert!(matches!(err, CodecError::ObjectDtype(_)));
    }

    #[test]
    fn pack_rejects_length_mismatch() {
        let tree = leaf("<i4", vec![3], vec![0, 0]); // too short
        let err = pack(&tree).unwrap_err();
        assert!(matches!(err, CodecError::LengthMismatch { .. }));
    }

    #[test]
    fn unpack_rejects_empty_payload() {
        let err = unpack(&[]).unwrap_err();
        assert!(matches!(err, CodecError::EmptyPayload));
    }

    #[quickcheck_macros::quickcheck]
    fn pack_then_unpack_is_identity(values: Vec<i32>) -> bool {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let tree = leaf("<i4", vec![values.len()], bytes);
        pack(&tree)
            .and_then(|packed| unpack(&packed))
            .map(|round| round == tree)
            .unwrap_or(false)
    }
}
