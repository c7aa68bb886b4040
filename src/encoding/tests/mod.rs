mod tests_sealed;
