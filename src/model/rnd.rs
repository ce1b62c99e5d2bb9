use rand::Rng;

/// Generate a vector of random bytes
///
/// # Example
/// ```
/// use rdp::model::rnd::random;
/// assert_eq!(random(32).len(), 32);
/// ```
pub fn random(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}
