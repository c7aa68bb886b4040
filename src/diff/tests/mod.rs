mod tests_oocore;
mod tests_patch;
