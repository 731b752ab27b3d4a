mod binding;
mod e2e;
mod utils;
