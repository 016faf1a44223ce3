use ndarray::Array2;
use rand::Rng;

// Generate a random vector with a given dimension
pub fn generate_random_vector(dimension: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dimension).map(|_| rng.gen::<f32>()).collect()
}

// Generate a random batch of row vectors
pub fn generate_random_batch(num_vectors: usize, dimension: usize) -> Array2<f32> {
    let mut rng = rand::thread_rng();
    Array2::from_shape_fn((num_vectors, dimension), |_| rng.gen::<f32>())
}
