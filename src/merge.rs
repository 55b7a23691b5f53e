//! `MergeOps` — deterministic reduction of a batch of same-named variables
//! (spec.md §4.C), ported from the original's `MergeVars<T>` (dense) and
//! `scatter::MergeAdd`/`MergeAverage` (sparse).

use std::collections::BTreeMap;

use crate::context::MergeMode;
use crate::error::{CommError, CommResult};
use crate::mathops::{vec_add_assign, vec_scale};
use crate::variable::{ElementType, Variable};

/// Sums (or averages) a batch of dense variables of identical shape and
/// element type into a freshly allocated dense tensor.
pub fn merge_dense(vars: &[Variable], mode: MergeMode) -> CommResult<Variable> {
    if vars.is_empty() {
        return Err(CommError::ContractViolation("merge_dense: empty input".into()));
    }

    let (shape, dtype) = match &vars[0] {
        Variable::Dense { shape, dtype, .. } => (shape.clone(), *dtype),
        Variable::SparseRow { .. } => {
            return Err(CommError::ContractViolation(
                "merge_dense called with a sparse-row variable".into(),
            ))
        }
    };

    let mut out = vec![0.0f32; shape.iter().product()];
    for v in vars {
        match v {
            Variable::Dense { shape: s, dtype: dt, data } => {
                if *s != shape {
                    return Err(CommError::ContractViolation(format!(
                        "merge_dense: shape mismatch {:?} vs {:?}",
                        s, shape
                    )));
                }
                if *dt != dtype {
                    return Err(CommError::ContractViolation(
                        "merge_dense: element type mismatch".into(),
                    ));
                }
                vec_add_assign(&mut out, data);
            }
            Variable::SparseRow { .. } => {
                return Err(CommError::ContractViolation(
                    "merge_dense called with a mixed batch".into(),
                ))
            }
        }
    }

    if mode == MergeMode::Average {
        vec_scale(&mut out, 1.0 / vars.len() as f32);
    }

    Ok(Variable::Dense { shape, dtype, data: out })
}

/// Accumulates a batch of sparse-row variables (sharing `width`) by row
/// index, emitting rows in sorted order. Height of the result is the max
/// input height.
pub fn merge_sparse(vars: &[Variable], mode: MergeMode) -> CommResult<Variable> {
    if vars.is_empty() {
        return Err(CommError::ContractViolation("merge_sparse: empty input".into()));
    }

    let width = match &vars[0] {
        Variable::SparseRow { width, .. } => *width,
        Variable::Dense { .. } => {
            return Err(CommError::ContractViolation(
                "merge_sparse called with a dense variable".into(),
            ))
        }
    };

    let mut height = 0u64;
    // row id -> (accumulated vector, occurrence count)
    let mut acc: BTreeMap<u64, (Vec<f32>, usize)> = BTreeMap::new();

    for v in vars {
        match v {
            Variable::SparseRow { height: h, rows, width: w, data } => {
                if *w != width {
                    return Err(CommError::ContractViolation(format!(
                        "merge_sparse: width mismatch {} vs {}",
                        w, width
                    )));
                }
                height = height.max(*h);
                for (i, &row) in rows.iter().enumerate() {
                    let src = &data[i * width..(i + 1) * width];
                    let entry = acc.entry(row).or_insert_with(|| (vec![0.0; width], 0));
                    vec_add_assign(&mut entry.0, src);
                    entry.1 += 1;
                }
            }
            Variable::Dense { .. } => {
                return Err(CommError::ContractViolation(
                    "merge_sparse called with a mixed batch".into(),
                ))
            }
        }
    }

    let mut rows = Vec::with_capacity(acc.len());
    let mut data = Vec::with_capacity(acc.len() * width);
    for (row, (mut vec, count)) in acc {
        if mode == MergeMode::Average {
            vec_scale(&mut vec, 1.0 / count as f32);
        }
        rows.push(row);
        data.extend_from_slice(&vec);
    }

    Ok(Variable::SparseRow { height, rows, width, data })
}

/// Dispatches to `merge_dense` or `merge_sparse` based on the batch's
/// actual variant, matching the original's runtime `IsType<...>` switch.
pub fn merge(vars: &[Variable], mode: MergeMode) -> CommResult<Variable> {
    if vars.is_empty() {
        return Err(CommError::ContractViolation("merge: empty input".into()));
    }
    match &vars[0] {
        Variable::Dense { .. } => merge_dense(vars, mode),
        Variable::SparseRow { .. } => merge_sparse(vars, mode),
    }
}
