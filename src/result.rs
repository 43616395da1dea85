//! Outcome taxonomy for a benchmark, a workload rank or a whole process group.
//!
//! A worker process reports its outcome through its exit code, which is the
//! discriminant of [`TestResult`].

use crate::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TestResult {
    Success = 0,
    Error = 1,
    DriverFunctionNotFound = 2,
    DeviceNotCapable = 3,
    ApiNotCapable = 4,
    KernelNotFound = 5,
    SkippedApi = 6,
    UnsupportedApi = 7,
    NoImplementation = 8,
    IntelExtensionsRequired = 9,
    InvalidArgs = 10,
    Nooped = 11,
    FilteredOut = 12,
    VerificationFail = 13,
    KernelBuildError = 14,
}

/// How a non-success result is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultInfo {
    pub tag: &'static str,
    pub print_in_single_test_mode: bool,
    pub print_in_all_tests_mode: bool,
    pub was_skipped: bool,
}

impl ResultInfo {
    const fn new(tag: &'static str, single: bool, all: bool, skipped: bool) -> Self {
        Self {
            tag,
            print_in_single_test_mode: single,
            print_in_all_tests_mode: all,
            was_skipped: skipped,
        }
    }
}

impl TestResult {
    pub const ALL: [TestResult; 15] = [
        TestResult::Success,
        TestResult::Error,
        TestResult::DriverFunctionNotFound,
        TestResult::DeviceNotCapable,
        TestResult::ApiNotCapable,
        TestResult::KernelNotFound,
        TestResult::SkippedApi,
        TestResult::UnsupportedApi,
        TestResult::NoImplementation,
        TestResult::IntelExtensionsRequired,
        TestResult::InvalidArgs,
        TestResult::Nooped,
        TestResult::FilteredOut,
        TestResult::VerificationFail,
        TestResult::KernelBuildError,
    ];

    pub fn info(self) -> ResultInfo {
        match self {
            TestResult::Success => ResultInfo::new("SUCCESS", false, false, false),
            TestResult::Error => ResultInfo::new("ERROR", true, true, false),
            TestResult::DriverFunctionNotFound => ResultInfo::new("NO_SUPPORT", true, true, true),
            TestResult::DeviceNotCapable => ResultInfo::new("NO_SUPPORT", true, false, true),
            TestResult::ApiNotCapable => ResultInfo::new("NO_SUPPORT (API)", true, false, true),
            TestResult::KernelNotFound => ResultInfo::new("MISSING_KERNEL", true, true, true),
            TestResult::SkippedApi => ResultInfo::new("SKIPPED", false, false, true),
            TestResult::UnsupportedApi => ResultInfo::new("SKIPPED", false, false, true),
            TestResult::NoImplementation => ResultInfo::new("NO_IMPLEMENT", true, false, true),
            TestResult::IntelExtensionsRequired => ResultInfo::new("NO_SUPPORT", true, false, true),
            TestResult::InvalidArgs => ResultInfo::new("INVALID_ARGS", true, true, true),
            TestResult::Nooped => ResultInfo::new("NOOP", true, true, true),
            TestResult::FilteredOut => ResultInfo::new("FILTERED_OUT", true, false, true),
            TestResult::VerificationFail => ResultInfo::new("VERIF_FAIL", true, true, false),
            TestResult::KernelBuildError => ResultInfo::new("KERNEL_BUILD_ERROR", true, true, false),
        }
    }

    pub fn tag(self) -> &'static str {
        self.info().tag
    }

    pub fn is_success(self) -> bool {
        self == TestResult::Success
    }

    pub fn was_skipped(self) -> bool {
        self.info().was_skipped
    }

    pub fn exit_code(self) -> i32 {
        self as i32
    }

    /// Decodes a child exit code. Codes outside the taxonomy count as `Error`.
    pub fn from_exit_code(code: i32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.exit_code() == code)
            .unwrap_or(TestResult::Error)
    }

    /// First non-success outcome in order, or `Success`.
    pub fn first_failure<I>(results: I) -> TestResult
    where
        I: IntoIterator<Item = TestResult>,
    {
        results
            .into_iter()
            .find(|r| !r.is_success())
            .unwrap_or(TestResult::Success)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl From<TestResult> for std::process::ExitCode {
    fn from(result: TestResult) -> Self {
        std::process::ExitCode::from(result as u8)
    }
}

impl From<&Error> for TestResult {
    fn from(err: &Error) -> Self {
        match err {
            Error::DeviceNotCapable(_) | Error::Unsupported(_) => TestResult::DeviceNotCapable,
            Error::InvalidArgs(_) | Error::Config(_) | Error::InvalidEncoding(_) => {
                TestResult::InvalidArgs
            }
            Error::KernelNotFound(_) => TestResult::KernelNotFound,
            _ => TestResult::Error,
        }
    }
}

impl<T> From<&crate::Result<T>> for TestResult {
    fn from(result: &crate::Result<T>) -> Self {
        match result {
            Ok(_) => TestResult::Success,
            Err(e) => TestResult::from(e),
        }
    }
}
