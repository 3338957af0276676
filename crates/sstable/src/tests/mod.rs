mod merge_tests;
