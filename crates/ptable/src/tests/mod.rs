mod format_tests;
mod helpers;
mod merge_tests;
