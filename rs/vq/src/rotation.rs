use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

// Below this norm a direction is too unreliable to divide by, so the
// blended alternative is used instead of the normalized one.
pub const NORM_MASK_THRESHOLD: f32 = 1e-5;
pub const NORM_EPS: f32 = 1e-8;

/// Scale a vector to unit length. Vectors with near-zero norm pass through
/// unchanged, as a blend rather than a branch, so the result stays finite
/// for every input.
pub fn normalize_masked(v: ArrayView1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    let mask = if norm > NORM_MASK_THRESHOLD { 1.0 } else { 0.0 };
    let scale = mask / (norm + NORM_EPS) + (1.0 - mask);
    &v * scale
}

/// Householder matrix I - 2 * v * v^T for the hyperplane orthogonal to `v`.
pub fn householder_matrix(v: ArrayView1<f32>) -> Array2<f32> {
    let dim = v.len();
    let col = v.insert_axis(Axis(1));
    let outer = col.dot(&col.t());
    Array2::eye(dim) - outer * 2.0
}

/// Reflection mapping the unit direction of `z_e` onto the unit direction
/// of `code`. When the two directions nearly coincide the difference vector
/// is left near-zero and the result is close to the identity.
pub fn rotation_matrix(z_e: ArrayView1<f32>, code: ArrayView1<f32>) -> Array2<f32> {
    let z_hat = normalize_masked(z_e);
    let q_hat = normalize_masked(code);

    let v = &z_hat - &q_hat;
    let v_norm = v.dot(&v).sqrt();
    let mask = if v_norm > NORM_MASK_THRESHOLD { 1.0 } else { 0.0 };
    let scale = mask / (v_norm + NORM_EPS) + (1.0 - mask);
    let v = &v * scale;

    householder_matrix(v.view())
}

/// Reflect every row of `z_e` toward its assigned code. The reflection is
/// built from normalized directions but applied to the unnormalized input,
/// so the output keeps the input's magnitude.
pub fn rotate_toward_codes(z_e: ArrayView2<f32>, codes: ArrayView2<f32>) -> Array2<f32> {
    let mut out = Array2::zeros(z_e.raw_dim());
    for (i, (z_row, code_row)) in z_e.outer_iter().zip(codes.outer_iter()).enumerate() {
        let rotation = rotation_matrix(z_row, code_row);
        out.row_mut(i).assign(&rotation.dot(&z_row));
    }
    out
}
