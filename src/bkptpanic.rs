// Kernel-internal invariant checks.
// Debug builds panic; release builds log and abort, since a broken kernel
// invariant leaves no state worth unwinding into.

macro_rules! bk_panic {
    ($($arg:tt)*) => ({
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        }
        else {
            log::error!($($arg)*);
            std::process::abort();
        }
    });
}

macro_rules! bk_assert {
    ($cond:expr) => ({
        if cfg!(debug_assertions) {
            assert!($cond);
        }
        else {
            if !$cond {
                log::error!("assertion failed: {}", stringify!($cond));
                std::process::abort();
            }
        }
    });
}

pub(crate) trait BKUnwrap<T>
{
    fn bk_unwrap(self) -> T;
}

impl<T> BKUnwrap<T> for Option<T>
{
    fn bk_unwrap(self) -> T
    {
        match self {
            Some(v) => v,
            None => bk_panic!("Unwrapping on `None`")
        }
    }
}
