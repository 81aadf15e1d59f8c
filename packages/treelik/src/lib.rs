pub mod cache;
pub mod constants;
pub mod engine;
pub mod kernel;
pub mod sim;
pub mod subst;
pub mod tree;
pub mod utils;

#[cfg(test)]
mod tests {
  use crate::utils::global_init::global_init;
  use ctor::ctor;

  #[ctor]
  fn init() {
    global_init();
  }
}
