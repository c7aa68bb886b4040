mod tests_ring;
