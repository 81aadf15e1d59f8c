pub const TINY_NUMBER: f64 = 1e-12;
pub const MIN_LOG: f64 = -1e8; // minimal log value

// Transition probabilities are clamped to zero below, and rejected above 1 + PROB_TOLERANCE
pub const PROB_TOLERANCE: f64 = 1e-9;

// Eigenvalues with absolute value below this are treated as zero (singular source matrix)
pub const SINGULAR_EIGENVALUE: f64 = 1e-12;
