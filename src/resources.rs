mod vault_map;

pub use vault_map::*;

/// Build an `ObjectMeta` from field assignments, defaulting the rest
#[macro_export]
macro_rules! meta {
    ($($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            $($lhs : $rhs,)*

            ..Default::default()
        }
    }};
}
