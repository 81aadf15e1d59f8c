pub mod brownian;
pub mod ctmc;
pub mod kernel;
pub mod multivariate;
pub mod rates;
