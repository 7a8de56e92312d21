use once_cell::sync::OnceCell;

use crate::{Branch, Builder, CommonAlreadyInitializedError};

static COMMON: OnceCell<Branch> = OnceCell::new();

/// Get a shared reference to a common branch for the entire process.
///
/// The common branch is created on first use, sized to the number of CPU
/// cores, and lives for the remainder of the process.
///
/// # Examples
///
/// ```
/// let result = arbor::common().execute(|| 2 + 2).unwrap().join();
///
/// assert_eq!(result, 4);
/// ```
pub fn common() -> &'static Branch {
    COMMON.get_or_init(|| common_builder().build())
}

/// Configure the common branch.
///
/// Call this near the start of the program, before anything touches the
/// common branch: once the branch has been initialized the configuration is
/// fixed and this function returns an error.
///
/// This is an application-level knob. A library that needs a particular
/// configuration should build its own [`Branch`] rather than configuring the
/// process-wide one out from under its host.
pub fn configure_common<F>(f: F) -> Result<(), CommonAlreadyInitializedError>
where
    F: FnOnce(Builder) -> Builder,
{
    let mut was_initialized = true;

    COMMON.get_or_init(|| {
        was_initialized = false;
        f(common_builder()).build()
    });

    if was_initialized {
        Err(CommonAlreadyInitializedError(()))
    } else {
        Ok(())
    }
}

fn common_builder() -> Builder {
    Branch::builder()
        .name("common-branch")
        .size(num_cpus::get().max(1))
}
