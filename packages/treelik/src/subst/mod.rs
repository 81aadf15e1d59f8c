pub mod subst_model;
