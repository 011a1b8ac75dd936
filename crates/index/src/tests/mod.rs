mod hash_tests;
mod helpers;
mod write_tests;
