pub use futures;
pub use paste;

pub mod autocow;
pub mod proxy;

pub use autocow::Ac;
